//! Durability step of the log, separate from appending.
//!
//! `FaultyFlusher` injects flush failures at runtime so the consensus layer's
//! reaction (leader step-down, follower retry) can be exercised.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Forces written segment data to stable storage
pub trait Flusher: Send + Sync {
    fn flush(&self, file: &File) -> io::Result<()>;
}

/// Flushes with `fdatasync`
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncFlusher;

impl Flusher for SyncFlusher {
    fn flush(&self, file: &File) -> io::Result<()> {
        file.sync_data()
    }
}

/// Switch controlling a `FaultyFlusher`
#[derive(Clone, Debug, Default)]
pub struct FlushFaults {
    faulty: Arc<AtomicBool>,
    failures: Arc<AtomicU64>,
}

impl FlushFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    pub fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::SeqCst)
    }

    /// Number of flushes rejected so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Flusher that fails on demand and otherwise syncs like `SyncFlusher`
#[derive(Clone, Debug, Default)]
pub struct FaultyFlusher {
    faults: FlushFaults,
}

impl FaultyFlusher {
    pub fn new(faults: FlushFaults) -> Self {
        Self { faults }
    }

    pub fn faults(&self) -> &FlushFaults {
        &self.faults
    }
}

impl Flusher for FaultyFlusher {
    fn flush(&self, file: &File) -> io::Result<()> {
        if self.faults.is_faulty() {
            self.faults.failures.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "injected flush failure"));
        }
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faulty_flusher_toggles() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = File::create(dir.path().join("f")).unwrap();
        let faults = FlushFaults::new();
        let flusher = FaultyFlusher::new(faults.clone());

        assert!(flusher.flush(&file).is_ok());
        faults.set_faulty(true);
        assert!(flusher.flush(&file).is_err());
        assert!(flusher.flush(&file).is_err());
        assert_eq!(faults.failures(), 2);
        faults.set_faulty(false);
        assert!(flusher.flush(&file).is_ok());
    }
}
