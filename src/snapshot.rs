//! Snapshots: content-addressed state bundles at a log index.
//!
//! A snapshot is opaque bytes (the exported state store) identified by the
//! index and term of the last entry it covers plus the SHA-256 of its content.
//! The store keeps only the newest snapshot of a partition.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slog::{info, Logger};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("snapshot chunk at offset {got} does not continue at {expected}")]
    ChunkOutOfOrder { expected: u64, got: u64 },

    #[error("malformed snapshot metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Identity of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotId {
    pub index: u64,
    pub term: u64,
    /// Hex SHA-256 of the snapshot bytes
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub data: Bytes,
}

pub fn checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Snapshot {
    pub fn new(index: u64, term: u64, data: Bytes) -> Self {
        let checksum = checksum(&data);
        Self {
            id: SnapshotId {
                index,
                term,
                checksum,
            },
            data,
        }
    }

    pub fn verify(&self) -> Result<(), SnapshotError> {
        let actual = checksum(&self.data);
        if actual != self.id.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.id.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Split into `(offset, chunk)` pairs of at most `chunk_size` bytes.
    /// An empty snapshot still yields one empty chunk.
    pub fn chunks(&self, chunk_size: usize) -> Vec<(u64, Bytes)> {
        let chunk_size = chunk_size.max(1);
        if self.data.is_empty() {
            return vec![(0, Bytes::new())];
        }
        (0..self.data.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(self.data.len());
                (start as u64, self.data.slice(start..end))
            })
            .collect()
    }
}

/// Reassembles a snapshot from install chunks
#[derive(Debug)]
pub struct SnapshotAssembler {
    pub index: u64,
    pub term: u64,
    buffer: Vec<u8>,
}

impl SnapshotAssembler {
    pub fn new(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            buffer: Vec::new(),
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn push(&mut self, offset: u64, chunk: &[u8]) -> Result<(), SnapshotError> {
        if offset != self.next_offset() {
            return Err(SnapshotError::ChunkOutOfOrder {
                expected: self.next_offset(),
                got: offset,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn finish(self, expected_checksum: &str) -> Result<Snapshot, SnapshotError> {
        let snapshot = Snapshot {
            id: SnapshotId {
                index: self.index,
                term: self.term,
                checksum: expected_checksum.to_string(),
            },
            data: Bytes::from(self.buffer),
        };
        snapshot.verify()?;
        Ok(snapshot)
    }
}

/// On-disk store holding the latest snapshot of one partition
pub struct SnapshotStore {
    dir: PathBuf,
    latest: Option<Snapshot>,
    logger: Logger,
}

const SNAPSHOT_META: &str = "snapshot.json";
const SNAPSHOT_DATA: &str = "snapshot.bin";

impl SnapshotStore {
    /// Open the store, loading a previously persisted snapshot if present
    pub fn open(dir: impl AsRef<Path>, logger: Logger) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join(SNAPSHOT_META);
        let latest = if meta_path.exists() {
            let id: SnapshotId = serde_json::from_slice(&fs::read(&meta_path)?)?;
            let data = Bytes::from(fs::read(dir.join(SNAPSHOT_DATA))?);
            let snapshot = Snapshot { id, data };
            snapshot.verify()?;
            info!(logger, "Loaded snapshot"; "index" => snapshot.id.index, "term" => snapshot.id.term);
            Some(snapshot)
        } else {
            None
        };

        Ok(Self { dir, latest, logger })
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Persist `snapshot`, replacing the current one if it is newer
    pub fn persist(&mut self, snapshot: Snapshot) -> Result<bool, SnapshotError> {
        snapshot.verify()?;
        if let Some(current) = &self.latest {
            if current.id.index >= snapshot.id.index {
                return Ok(false);
            }
        }

        // Data first, metadata last: the metadata file commits the snapshot
        write_atomically(&self.dir, SNAPSHOT_DATA, &snapshot.data)?;
        write_atomically(&self.dir, SNAPSHOT_META, &serde_json::to_vec(&snapshot.id)?)?;

        info!(self.logger, "Persisted snapshot";
            "index" => snapshot.id.index, "term" => snapshot.id.term,
            "bytes" => snapshot.data.len(), "checksum" => &snapshot.id.checksum);
        self.latest = Some(snapshot);
        Ok(true)
    }
}

fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!("{}.tmp", name));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn create_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    }

    #[test]
    fn test_chunks_reassemble() {
        let snapshot = Snapshot::new(10, 2, Bytes::from(vec![7u8; 1000]));
        let chunks = snapshot.chunks(300);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].0, 900);

        let mut assembler = SnapshotAssembler::new(10, 2);
        for (offset, chunk) in &chunks {
            assembler.push(*offset, chunk).unwrap();
        }
        assert_eq!(assembler.finish(&snapshot.id.checksum).unwrap(), snapshot);
    }

    #[test]
    fn test_out_of_order_chunk_rejected() {
        let mut assembler = SnapshotAssembler::new(1, 1);
        assert!(matches!(
            assembler.push(5, b"abc"),
            Err(SnapshotError::ChunkOutOfOrder { expected: 0, got: 5 })
        ));
    }

    #[test]
    fn test_tampered_snapshot_fails_verification() {
        let mut snapshot = Snapshot::new(1, 1, Bytes::from_static(b"state"));
        snapshot.data = Bytes::from_static(b"other");
        assert!(matches!(snapshot.verify(), Err(SnapshotError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_store_keeps_newest_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = SnapshotStore::open(dir.path(), create_logger()).unwrap();
        assert!(store.persist(Snapshot::new(5, 1, Bytes::from_static(b"five"))).unwrap());
        assert!(!store.persist(Snapshot::new(3, 1, Bytes::from_static(b"three"))).unwrap());
        drop(store);

        let store = SnapshotStore::open(dir.path(), create_logger()).unwrap();
        let latest = store.latest().unwrap();
        assert_eq!(latest.id.index, 5);
        assert_eq!(latest.data, Bytes::from_static(b"five"));
    }
}
