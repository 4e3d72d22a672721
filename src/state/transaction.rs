use super::{cf_handle, read_db, scan_db, Family, StateError, StateRead};
use rocksdb::{WriteBatch, DB};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Buffered write transaction. `None` in the overlay marks a delete.
///
/// Dropping an uncommitted transaction discards its writes and releases the
/// writer slot.
pub struct Transaction {
    db: Arc<DB>,
    overlay: BTreeMap<(Family, Vec<u8>), Option<Vec<u8>>>,
    writer: Arc<AtomicBool>,
}

impl Transaction {
    pub(super) fn new(db: Arc<DB>, writer: Arc<AtomicBool>) -> Self {
        Self {
            db,
            overlay: BTreeMap::new(),
            writer,
        }
    }

    pub fn put(&mut self, family: Family, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert((family, key), Some(value));
    }

    pub fn delete(&mut self, family: Family, key: Vec<u8>) {
        self.overlay.insert((family, key), None);
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty()
    }

    /// Write every buffered change in one batch. On failure nothing is
    /// written and the buffer is kept, so the commit can be retried.
    pub fn commit(&mut self) -> Result<(), StateError> {
        let mut batch = WriteBatch::default();
        for ((family, key), value) in &self.overlay {
            let cf = cf_handle(&self.db, *family)?;
            match value {
                Some(value) => batch.put_cf(cf, key, value),
                None => batch.delete_cf(cf, key),
            }
        }
        self.db.write(batch)?;
        self.overlay.clear();
        Ok(())
    }

    pub fn rollback(self) {}
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.writer.store(false, Ordering::Release);
    }
}

impl StateRead for Transaction {
    fn read(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        match self.overlay.get(&(family, key.to_vec())) {
            Some(buffered) => Ok(buffered.clone()),
            None => read_db(&self.db, family, key),
        }
    }

    fn scan(&self, family: Family) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = scan_db(&self.db, family)?.into_iter().collect();
        for ((buffered_family, key), value) in &self.overlay {
            if *buffered_family != family {
                continue;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}
