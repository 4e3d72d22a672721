//! Engine entities stored in the partition's column families.

use super::record::{DeploymentRecord, UsageMetricRecord};
use crate::state::{Family, StateError, StateRead, Transaction, TypedColumnFamily};
use serde::{Deserialize, Serialize};

/// A running process instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub key: u64,
    pub process_id: String,
    pub tasks: Vec<String>,
    /// Index of the task the instance waits on
    pub task_index: usize,
    pub variables: serde_json::Value,
    pub tenant_id: String,
}

impl ProcessInstance {
    pub fn current_task(&self) -> Option<&str> {
        self.tasks.get(self.task_index).map(String::as_str)
    }
}

pub(crate) const DEPLOYMENTS: TypedColumnFamily<String, DeploymentRecord> =
    TypedColumnFamily::new(Family::Deployments);
pub(crate) const INSTANCES: TypedColumnFamily<u64, ProcessInstance> =
    TypedColumnFamily::new(Family::ProcessInstances);
pub(crate) const USAGE: TypedColumnFamily<String, UsageMetricRecord> =
    TypedColumnFamily::new(Family::UsageMetrics);
const KEYS: TypedColumnFamily<String, u64> = TypedColumnFamily::new(Family::Key);

const NEXT_KEY: &str = "next_key";
pub(crate) const ACTIVE_BUCKET: &str = "active";

/// Bits below the partition id in every generated key
pub const PARTITION_BITS: u32 = 51;

/// Generates partition-unique keys. The counter lives in the `key` column
/// family so it is part of the processing transaction and of snapshots.
#[derive(Clone, Copy, Debug)]
pub struct KeyGenerator {
    partition: u32,
}

impl KeyGenerator {
    pub fn new(partition: u32) -> Self {
        Self { partition }
    }

    fn first_key(&self) -> u64 {
        ((self.partition as u64) << PARTITION_BITS) + 1
    }

    pub fn partition_of(key: u64) -> u32 {
        (key >> PARTITION_BITS) as u32
    }

    pub fn next_key(&self, txn: &mut Transaction) -> Result<u64, StateError> {
        let key = KEYS
            .get(txn, &NEXT_KEY.to_string())?
            .unwrap_or_else(|| self.first_key());
        KEYS.put(txn, &NEXT_KEY.to_string(), &(key + 1))?;
        Ok(key)
    }

    /// Move the counter past a key seen in a replayed event
    pub fn observe(&self, txn: &mut Transaction, key: u64) -> Result<(), StateError> {
        if Self::partition_of(key) != self.partition {
            return Ok(());
        }
        let next = KEYS
            .get(txn, &NEXT_KEY.to_string())?
            .unwrap_or_else(|| self.first_key());
        if key >= next {
            KEYS.put(txn, &NEXT_KEY.to_string(), &(key + 1))?;
        }
        Ok(())
    }

    pub fn peek(&self, reader: &impl StateRead) -> Result<u64, StateError> {
        Ok(KEYS
            .get(reader, &NEXT_KEY.to_string())?
            .unwrap_or_else(|| self.first_key()))
    }
}
