//! Replicated log storage (Layer 1)
//!
//! Durable, segmented, append-only sequence of entries for one partition.
//! Appending only writes; durability is a separate `flush` step whose failure
//! is reported as a `FlushError` so consensus can react to it.
//!
//! # Layout
//!
//! - `segment-<first index>.log`: header plus CRC-framed entries. The header
//!   also holds the term of the entry before the first one, so the
//!   compaction boundary keeps its term across restarts.
//! - `meta.json`: current term and vote (see `MetaStore`)
//!
//! All entries after the compaction point are mirrored in memory.

mod entry;
mod flusher;
mod meta;
mod segment;

pub use entry::{EntryPayload, LogEntry};
pub use flusher::{FaultyFlusher, FlushFaults, Flusher, SyncFlusher};
pub use meta::{MetaStore, RaftMeta};

use crate::config::LogConfig;
use crate::retry::Recoverable;
use segment::{parse_segment_file_name, Segment};
use slog::{debug, info, warn, Logger};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors of log mutations other than flushing
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("entry index {got} does not follow last index {last}")]
    NonContiguous { last: u64, got: u64 },

    #[error("entry term {term} at index {index} is lower than last term {last_term}")]
    TermRegression { index: u64, term: u64, last_term: u64 },

    #[error("cannot truncate from index {from}: entries up to {commit_index} are committed")]
    TruncateCommitted { from: u64, commit_index: u64 },

    #[error("corrupt segment {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Flush(#[from] FlushError),
}

/// A flush did not reach stable storage
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to flush log up to index {index}: {reason}")]
pub struct FlushError {
    pub index: u64,
    pub reason: String,
}

impl Recoverable for LogError {
    fn is_recoverable(&self) -> bool {
        matches!(self, LogError::Io(_) | LogError::Flush(_))
    }
}

impl Recoverable for FlushError {
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Segmented, append-only log of one partition
pub struct RaftLog {
    dir: PathBuf,
    segment_max_bytes: u64,
    segments: Vec<Segment>,
    /// entries[i].index == base_index + 1 + i
    entries: VecDeque<LogEntry>,
    /// Index and term of the entry preceding the first retained one
    base_index: u64,
    base_term: u64,
    flushed_index: u64,
    commit_index: u64,
    flusher: Arc<dyn Flusher>,
    logger: Logger,
}

impl RaftLog {
    /// Open (or create) the log in `dir`, recovering whatever is on disk
    pub fn open(
        dir: impl AsRef<Path>,
        config: &LogConfig,
        flusher: Arc<dyn Flusher>,
        logger: Logger,
    ) -> Result<Self, LogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut files: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                parse_segment_file_name(name.to_str()?).map(|first| (first, entry.path()))
            })
            .collect();
        files.sort_by_key(|(first, _)| *first);

        let mut segments: Vec<Segment> = Vec::new();
        let mut entries = VecDeque::new();
        let mut files = files.into_iter();
        let mut stop = false;

        for (_, path) in files.by_ref() {
            let opened = Segment::open(&path)?;
            let expected = entries
                .back()
                .map(|e: &LogEntry| e.index + 1)
                .unwrap_or(opened.segment.first_index);
            if opened.segment.first_index != expected {
                warn!(logger, "Segment does not continue the log, dropping it and its successors";
                    "path" => path.display().to_string(), "expected_first" => expected);
                opened.segment.delete()?;
                stop = true;
                break;
            }

            if opened.truncated {
                warn!(logger, "Cut torn tail of segment";
                    "path" => path.display().to_string(), "entries" => opened.entries.len());
            }
            let truncated = opened.truncated;
            entries.extend(opened.entries);
            segments.push(opened.segment);
            if truncated {
                stop = true;
                break;
            }
        }
        if stop {
            for (_, path) in files {
                fs::remove_file(&path)?;
            }
        }

        let base_index = segments.first().map(|s| s.first_index - 1).unwrap_or(0);
        let base_term = segments.first().map(|s| s.prev_term).unwrap_or(0);
        let last_index = entries.back().map(|e| e.index).unwrap_or(base_index);

        info!(logger, "Opened log";
            "dir" => dir.display().to_string(), "segments" => segments.len(),
            "first_index" => base_index + 1, "last_index" => last_index);

        Ok(Self {
            dir,
            segment_max_bytes: config.segment_max_bytes,
            segments,
            entries,
            base_index,
            base_term,
            flushed_index: last_index,
            commit_index: base_index,
            flusher,
            logger,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.base_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.entries.back().map(|e| e.index).unwrap_or(self.base_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map(|e| e.term).unwrap_or(self.base_term)
    }

    pub fn flushed_index(&self) -> u64 {
        self.flushed_index
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commit index never moves backwards; it guards truncation
    pub fn set_commit_index(&mut self, index: u64) {
        self.commit_index = self.commit_index.max(index);
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.base_index {
            return None;
        }
        self.entries.get((index - self.base_index - 1) as usize)
    }

    /// Term of the entry at `index`, including the compaction boundary
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `from`
    pub fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from <= self.base_index {
            return Vec::new();
        }
        let start = (from - self.base_index - 1) as usize;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Entries in `[from, to]`
    pub fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.entries(from, (to - from + 1) as usize)
    }

    /// Append at the end of the log. Does not flush.
    pub fn append(&mut self, entry: LogEntry) -> Result<u64, LogError> {
        let last = self.last_index();
        if entry.index != last + 1 {
            return Err(LogError::NonContiguous {
                last,
                got: entry.index,
            });
        }
        let last_term = self.last_term();
        if entry.term < last_term {
            return Err(LogError::TermRegression {
                index: entry.index,
                term: entry.term,
                last_term,
            });
        }

        let frame = entry.encode_frame();
        let roll = match self.segments.last() {
            None => true,
            Some(active) => {
                active.entry_count() > 0
                    && active.size() + frame.len() as u64 > self.segment_max_bytes
            }
        };
        if roll {
            debug!(self.logger, "Rolling log segment"; "first_index" => entry.index);
            let prev_term = self.last_term();
            self.segments.push(Segment::create(&self.dir, entry.index, prev_term)?);
        }

        if let Some(active) = self.segments.last_mut() {
            active.append(&frame)?;
        }
        let index = entry.index;
        self.entries.push_back(entry);
        Ok(index)
    }

    /// Force everything appended so far to stable storage
    pub fn flush(&mut self) -> Result<u64, FlushError> {
        let last = self.last_index();
        if self.flushed_index >= last && self.segments.iter().all(|s| !s.dirty) {
            return Ok(self.flushed_index);
        }

        let flusher = &self.flusher;
        for segment in self.segments.iter_mut().filter(|s| s.dirty) {
            flusher.flush(segment.file()).map_err(|e| FlushError {
                index: last,
                reason: e.to_string(),
            })?;
            segment.dirty = false;
        }

        self.flushed_index = last;
        Ok(last)
    }

    /// Discard all entries at or after `from`. Committed entries are never discarded.
    pub fn truncate(&mut self, from: u64) -> Result<(), LogError> {
        if from <= self.commit_index {
            return Err(LogError::TruncateCommitted {
                from,
                commit_index: self.commit_index,
            });
        }
        if from > self.last_index() {
            return Ok(());
        }

        info!(self.logger, "Truncating uncommitted log suffix";
            "from" => from, "last_index" => self.last_index());

        self.entries.truncate((from - self.base_index - 1) as usize);
        // Lowered first: a failed flush below must not leave it past the new tail
        self.flushed_index = self.flushed_index.min(from - 1);

        while self.segments.len() > 1
            && self.segments.last().map(|s| s.first_index >= from).unwrap_or(false)
        {
            if let Some(segment) = self.segments.pop() {
                segment.delete()?;
            }
        }
        if let Some(active) = self.segments.last_mut() {
            if from >= active.first_index {
                active.truncate_entries((from - active.first_index) as usize)?;
                self.flusher.flush(active.file()).map_err(|e| FlushError {
                    index: from - 1,
                    reason: e.to_string(),
                })?;
                active.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop whole segments whose entries are all at or below `index`
    pub fn compact(&mut self, index: u64) -> Result<usize, LogError> {
        let mut removed = 0;
        while self.segments.len() > 1 {
            let next_first = self.segments[1].first_index;
            if next_first - 1 > index {
                break;
            }
            let segment = self.segments.remove(0);
            segment.delete()?;
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }

        let new_base = self.segments[0].first_index - 1;
        let base_term = self.segments[0].prev_term;
        let drop_count = (new_base - self.base_index) as usize;
        self.entries.drain(..drop_count.min(self.entries.len()));
        self.base_index = new_base;
        self.base_term = base_term;

        info!(self.logger, "Compacted log"; "segments_removed" => removed, "first_index" => new_base + 1);
        Ok(removed)
    }

    /// Wipe the log so that the next appended entry is `next_index`
    pub fn reset(&mut self, next_index: u64, base_term: u64) -> Result<(), LogError> {
        info!(self.logger, "Resetting log"; "next_index" => next_index, "last_index" => self.last_index());
        for segment in self.segments.drain(..) {
            segment.delete()?;
        }
        self.entries.clear();
        self.base_index = next_index.saturating_sub(1);
        self.base_term = base_term;
        self.flushed_index = self.base_index;
        self.commit_index = self.base_index;

        // An empty segment records the new starting index across restarts
        let mut segment = Segment::create(&self.dir, next_index, base_term)?;
        self.flusher.flush(segment.file()).map_err(|e| FlushError {
            index: self.base_index,
            reason: e.to_string(),
        })?;
        segment.dirty = false;
        self.segments.push(segment);
        Ok(())
    }
}
