//! Embedded state store (Layer 4)
//!
//! RocksDB with one column family per kind of engine state. The stream
//! processor is the single writer: every mutation goes through a
//! `Transaction` that buffers writes in memory (reads see them) and commits
//! them atomically as one `WriteBatch`.
//!
//! # Column families
//!
//! - `default`: miscellaneous singletons
//! - `key`: next key of the key generator
//! - `last_processed_position`: the processor's position marker
//! - `banned_instance`: blacklisted process instances
//! - `deployments`, `process_instances`: engine entities
//! - `usage_metrics`: the active usage bucket

mod column_family;
mod transaction;

pub use column_family::{DbKey, TypedColumnFamily};
pub use transaction::Transaction;

use crate::retry::Recoverable;
use bytes::Bytes;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Default,
    Key,
    LastProcessedPosition,
    BannedInstance,
    Deployments,
    ProcessInstances,
    UsageMetrics,
}

impl Family {
    pub const ALL: [Family; 7] = [
        Family::Default,
        Family::Key,
        Family::LastProcessedPosition,
        Family::BannedInstance,
        Family::Deployments,
        Family::ProcessInstances,
        Family::UsageMetrics,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Family::Default => "default",
            Family::Key => "key",
            Family::LastProcessedPosition => "last_processed_position",
            Family::BannedInstance => "banned_instance",
            Family::Deployments => "deployments",
            Family::ProcessInstances => "process_instances",
            Family::UsageMetrics => "usage_metrics",
        }
    }

    fn from_name(name: &str) -> Option<Family> {
        Family::ALL.into_iter().find(|family| family.name() == name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state store error: {0}")]
    Db(#[from] rocksdb::Error),

    #[error("column family {0} is missing")]
    MissingFamily(&'static str),

    #[error("failed to encode or decode state value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("another transaction is already open on this state store")]
    TransactionInProgress,

    #[error("key {key} already exists in {family}")]
    KeyExists { family: &'static str, key: String },

    #[error("key {key} does not exist in {family}")]
    KeyMissing { family: &'static str, key: String },

    #[error("undecodable key in {family}")]
    InvalidKey { family: &'static str },

    #[error("unknown column family {0} in state bundle")]
    UnknownFamily(String),
}

impl Recoverable for StateError {
    fn is_recoverable(&self) -> bool {
        matches!(self, StateError::Db(_) | StateError::TransactionInProgress)
    }
}

/// Read access shared by the store and its transactions
pub trait StateRead {
    fn read(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;

    /// All pairs of a family in key order
    fn scan(&self, family: Family) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError>;
}

/// Serialized content of every column family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBundle {
    pub families: BTreeMap<String, Vec<(Vec<u8>, Vec<u8>)>>,
}

pub struct StateDb {
    db: Arc<DB>,
    writer: Arc<AtomicBool>,
    logger: Logger,
}

impl StateDb {
    pub fn open(path: impl AsRef<Path>, logger: Logger) -> Result<Self, StateError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = Family::ALL
            .iter()
            .map(|family| ColumnFamilyDescriptor::new(family.name(), Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        info!(logger, "Opened state store"; "path" => path.display().to_string());
        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(AtomicBool::new(false)),
            logger,
        })
    }

    /// Open the single write transaction
    pub fn begin(&self) -> Result<Transaction, StateError> {
        if self
            .writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::TransactionInProgress);
        }
        Ok(Transaction::new(self.db.clone(), self.writer.clone()))
    }

    /// Serialize every column family
    pub fn export(&self) -> Result<Bytes, StateError> {
        let mut bundle = StateBundle::default();
        for family in Family::ALL {
            bundle
                .families
                .insert(family.name().to_string(), self.scan(family)?);
        }
        Ok(Bytes::from(serde_json::to_vec(&bundle)?))
    }

    /// Replace the whole store with an exported bundle, atomically
    pub fn restore(&self, bundle: &[u8]) -> Result<(), StateError> {
        let bundle: StateBundle = serde_json::from_slice(bundle)?;
        let mut batch = WriteBatch::default();

        for family in Family::ALL {
            let cf = cf_handle(&self.db, family)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }
        let mut restored = 0usize;
        for (name, pairs) in &bundle.families {
            let family = Family::from_name(name).ok_or_else(|| StateError::UnknownFamily(name.clone()))?;
            let cf = cf_handle(&self.db, family)?;
            for (key, value) in pairs {
                batch.put_cf(cf, key, value);
                restored += 1;
            }
        }
        self.db.write(batch)?;

        info!(self.logger, "Restored state store"; "entries" => restored);
        Ok(())
    }
}

pub(crate) fn cf_handle(db: &DB, family: Family) -> Result<&rocksdb::ColumnFamily, StateError> {
    db.cf_handle(family.name())
        .ok_or(StateError::MissingFamily(family.name()))
}

pub(crate) fn read_db(db: &DB, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
    Ok(db.get_cf(cf_handle(db, family)?, key)?)
}

pub(crate) fn scan_db(db: &DB, family: Family) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
    let cf = cf_handle(db, family)?;
    db.iterator_cf(cf, IteratorMode::Start)
        .map(|item| {
            item.map(|(key, value)| (key.to_vec(), value.to_vec()))
                .map_err(StateError::from)
        })
        .collect()
}

impl StateRead for StateDb {
    fn read(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        read_db(&self.db, family, key)
    }

    fn scan(&self, family: Family) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        scan_db(&self.db, family)
    }
}
