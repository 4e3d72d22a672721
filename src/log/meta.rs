//! Persistent Raft metadata (current term, vote and the inactive mark).

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const META_FILE: &str = "meta.json";
const META_TMP_FILE: &str = "meta.json.tmp";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMeta {
    pub term: u64,
    pub voted_for: Option<u64>,
    /// Set after a safety violation, cleared only by a snapshot install
    #[serde(default)]
    pub inactive: bool,
}

/// Stores `RaftMeta` with write-to-temp-then-rename so a crash never leaves a partial file
#[derive(Debug)]
pub struct MetaStore {
    dir: PathBuf,
    current: RaftMeta,
}

impl MetaStore {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(META_FILE);
        let current = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => RaftMeta::default(),
            Err(e) => return Err(e),
        };

        Ok(Self { dir, current })
    }

    pub fn get(&self) -> RaftMeta {
        self.current
    }

    pub fn store(&mut self, meta: RaftMeta) -> io::Result<()> {
        if meta == self.current {
            return Ok(());
        }

        let bytes = serde_json::to_vec(&meta).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.dir.join(META_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(META_FILE))?;
        self.current = meta;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.get(), RaftMeta::default());

        store
            .store(RaftMeta {
                term: 4,
                voted_for: Some(2),
                inactive: true,
            })
            .unwrap();

        let reopened = MetaStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get().term, 4);
        assert_eq!(reopened.get().voted_for, Some(2));
        assert!(reopened.get().inactive);
    }

    #[test]
    fn test_meta_without_inactive_mark_reads_as_active() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join(META_FILE), br#"{"term":3,"voted_for":null}"#).unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.get().term, 3);
        assert!(!store.get().inactive);
    }
}
