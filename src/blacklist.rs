//! Poison-record isolation.
//!
//! A process instance whose records fail with an unrecoverable error is
//! added to the `banned_instance` column family. Every later record that
//! references it is skipped instead of applied. Entries only leave the set
//! through an explicit unban.

use crate::engine::{Record, RecordType, ValueType};
use crate::metrics::PartitionMetrics;
use crate::state::{Family, StateError, StateRead, Transaction, TypedColumnFamily};
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedInstance {
    /// Position of the record whose failure banned the instance
    pub banned_at: u64,
}

const BANNED: TypedColumnFamily<u64, BannedInstance> = TypedColumnFamily::new(Family::BannedInstance);

#[derive(Clone)]
pub struct Blacklist {
    metrics: Arc<PartitionMetrics>,
    logger: Logger,
}

impl Blacklist {
    pub fn new(metrics: Arc<PartitionMetrics>, logger: Logger) -> Self {
        Self { metrics, logger }
    }

    /// Instance to ban when `record` fails, if its kind is ban-on-error
    fn ban_target(record: &Record) -> Option<u64> {
        match (record.value_type, record.record_type) {
            (ValueType::ProcessInstance, RecordType::Command | RecordType::Event) => {
                record.process_instance_key()
            }
            _ => None,
        }
    }

    /// Ban the instance of a failed record. Returns true if the record's kind
    /// is ban-on-error and the instance is now banned.
    pub fn try_blacklist(&self, txn: &mut Transaction, record: &Record) -> Result<bool, StateError> {
        let Some(key) = Self::ban_target(record) else {
            return Ok(false);
        };
        self.ban(txn, key, record.position)?;
        Ok(true)
    }

    /// Idempotent
    pub fn ban(&self, txn: &mut Transaction, key: u64, position: u64) -> Result<(), StateError> {
        if BANNED.exists(txn, &key)? {
            return Ok(());
        }
        BANNED.put(txn, &key, &BannedInstance { banned_at: position })?;
        warn!(self.logger, "Blacklisted process instance"; "key" => key, "position" => position);
        Ok(())
    }

    pub fn is_blacklisted(&self, reader: &impl StateRead, key: u64) -> Result<bool, StateError> {
        BANNED.exists(reader, &key)
    }

    /// Whether `record` references a banned instance
    pub fn is_record_blacklisted(&self, reader: &impl StateRead, record: &Record) -> Result<bool, StateError> {
        match record.process_instance_key() {
            Some(key) if record.value_type == ValueType::ProcessInstance => self.is_blacklisted(reader, key),
            _ => Ok(false),
        }
    }

    /// Operator unban. Returns false if the instance was not banned.
    pub fn remove(&self, txn: &mut Transaction, key: u64) -> Result<bool, StateError> {
        if !BANNED.exists(txn, &key)? {
            return Ok(false);
        }
        BANNED.delete(txn, &key);
        info!(self.logger, "Removed process instance from blacklist"; "key" => key);
        Ok(true)
    }

    pub fn size(&self, reader: &impl StateRead) -> Result<u64, StateError> {
        Ok(reader.scan(Family::BannedInstance)?.len() as u64)
    }

    pub fn banned(&self, reader: &impl StateRead) -> Result<Vec<u64>, StateError> {
        Ok(BANNED.entries(reader)?.into_iter().map(|(key, _)| key).collect())
    }

    /// Refresh the size gauge from committed state
    pub fn publish_size(&self, reader: &impl StateRead) -> Result<(), StateError> {
        self.metrics.set_blacklist_size(self.size(reader)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Intent, ProcessInstanceRecord, RecordValue};
    use crate::state::StateDb;
    use slog::{o, Discard};

    fn instance_command(key: u64) -> Record {
        let mut record = Record::command(
            Intent::CompleteTask,
            RecordValue::ProcessInstance(ProcessInstanceRecord {
                process_instance_key: key,
                process_id: "order".to_string(),
                task_index: 0,
                variables: serde_json::Value::Null,
            }),
        );
        record.position = 12;
        record
    }

    #[test]
    fn test_ban_is_persistent_and_counted() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = StateDb::open(dir.path(), Logger::root(Discard, o!())).unwrap();
        let metrics = Arc::new(PartitionMetrics::new(1));
        let blacklist = Blacklist::new(metrics.clone(), Logger::root(Discard, o!()));

        let mut txn = db.begin().unwrap();
        assert!(blacklist.try_blacklist(&mut txn, &instance_command(5)).unwrap());
        // Banning twice keeps the original position
        blacklist.ban(&mut txn, 5, 99).unwrap();
        txn.commit().unwrap();
        drop(txn);

        assert!(blacklist.is_blacklisted(&db, 5).unwrap());
        assert!(blacklist.is_record_blacklisted(&db, &instance_command(5)).unwrap());
        assert!(!blacklist.is_record_blacklisted(&db, &instance_command(6)).unwrap());
        blacklist.publish_size(&db).unwrap();
        assert_eq!(metrics.snapshot().blacklist_size, 1);
        assert_eq!(BANNED.get(&db, &5).unwrap().unwrap().banned_at, 12);
    }

    #[test]
    fn test_records_without_instance_are_not_banned() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = StateDb::open(dir.path(), Logger::root(Discard, o!())).unwrap();
        let blacklist = Blacklist::new(Arc::new(PartitionMetrics::new(1)), Logger::root(Discard, o!()));

        let deployment = Record::command(
            Intent::Create,
            RecordValue::Deployment(crate::engine::DeploymentRecord {
                process_id: "p".to_string(),
                key: 0,
                version: 0,
                tasks: vec![],
            }),
        );
        let mut txn = db.begin().unwrap();
        assert!(!blacklist.try_blacklist(&mut txn, &deployment).unwrap());
        assert!(!blacklist.remove(&mut txn, 1).unwrap());
    }
}
