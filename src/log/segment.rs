//! Segment files of the replicated log.
//!
//! A segment starts with a checksummed header naming the index of its first
//! entry and the term of the entry just before it, followed by CRC-framed
//! entries with consecutive indexes.

use super::entry::{decode_frame, FrameRead, LogEntry};
use super::LogError;
use crc32c::crc32c;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_MAGIC: &[u8; 5] = b"RSLOG";
pub(crate) const SEGMENT_VERSION: u32 = 1;
/// magic + version + first index + previous term + crc
pub(crate) const SEGMENT_HEADER_LEN: usize = 5 + 4 + 8 + 8 + 4;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

pub(crate) fn segment_file_name(first_index: u64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, first_index, SEGMENT_SUFFIX)
}

/// Parse the first index out of a segment file name
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

fn encode_header(first_index: u64, prev_term: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_LEN);
    buf.extend_from_slice(SEGMENT_MAGIC);
    buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
    buf.extend_from_slice(&first_index.to_le_bytes());
    buf.extend_from_slice(&prev_term.to_le_bytes());
    let crc = crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// First index and previous term
fn decode_header(path: &Path, bytes: &[u8]) -> Result<(u64, u64), LogError> {
    let corrupt = |reason: &str| LogError::Corrupt {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    if bytes.len() < SEGMENT_HEADER_LEN {
        return Err(corrupt("segment header truncated"));
    }
    if &bytes[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
        return Err(corrupt("segment magic mismatch"));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[5..9]);
    if u32::from_le_bytes(version) != SEGMENT_VERSION {
        return Err(corrupt("unsupported segment version"));
    }

    let mut first_index = [0u8; 8];
    first_index.copy_from_slice(&bytes[9..17]);
    let mut prev_term = [0u8; 8];
    prev_term.copy_from_slice(&bytes[17..25]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[25..29]);
    if crc32c(&bytes[..25]) != u32::from_le_bytes(crc) {
        return Err(corrupt("segment header checksum mismatch"));
    }

    Ok((u64::from_le_bytes(first_index), u64::from_le_bytes(prev_term)))
}

/// Result of scanning a segment on open
pub(crate) struct OpenedSegment {
    pub segment: Segment,
    pub entries: Vec<LogEntry>,
    /// A torn or corrupt tail was cut off
    pub truncated: bool,
}

pub(crate) struct Segment {
    pub first_index: u64,
    /// Term of entry `first_index - 1`
    pub prev_term: u64,
    path: PathBuf,
    file: File,
    /// Byte offset of each entry's frame
    offsets: Vec<u64>,
    size: u64,
    /// Written since the last flush
    pub dirty: bool,
}

impl Segment {
    pub fn create(dir: &Path, first_index: u64, prev_term: u64) -> Result<Self, LogError> {
        let path = dir.join(segment_file_name(first_index));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let header = encode_header(first_index, prev_term);
        file.write_all(&header)?;

        Ok(Self {
            first_index,
            prev_term,
            path,
            file,
            offsets: Vec::new(),
            size: header.len() as u64,
            dirty: true,
        })
    }

    /// Open an existing segment, cutting off a torn or corrupt tail
    pub fn open(path: &Path) -> Result<OpenedSegment, LogError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (first_index, prev_term) = decode_header(path, &bytes)?;
        let mut offsets = Vec::new();
        let mut entries = Vec::new();
        let mut position = SEGMENT_HEADER_LEN;
        let mut truncated = false;

        while position < bytes.len() {
            match decode_frame(&bytes[position..]) {
                FrameRead::Entry(entry, len) => {
                    if entry.index != first_index + entries.len() as u64 {
                        truncated = true;
                        break;
                    }
                    offsets.push(position as u64);
                    entries.push(entry);
                    position += len;
                }
                FrameRead::Torn | FrameRead::Corrupt(_) => {
                    truncated = true;
                    break;
                }
            }
        }

        if truncated {
            file.set_len(position as u64)?;
            file.sync_all()?;
        }

        Ok(OpenedSegment {
            segment: Segment {
                first_index,
                prev_term,
                path: path.to_path_buf(),
                file,
                offsets,
                size: position as u64,
                dirty: false,
            },
            entries,
            truncated,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn append(&mut self, frame: &[u8]) -> Result<(), LogError> {
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(frame)?;
        self.offsets.push(self.size);
        self.size += frame.len() as u64;
        self.dirty = true;
        Ok(())
    }

    /// Keep only the first `keep` entries
    pub fn truncate_entries(&mut self, keep: usize) -> Result<(), LogError> {
        if keep >= self.offsets.len() {
            return Ok(());
        }
        let new_size = self.offsets[keep];
        self.file.set_len(new_size)?;
        self.offsets.truncate(keep);
        self.size = new_size;
        self.dirty = true;
        Ok(())
    }

    pub fn delete(self) -> Result<(), LogError> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_segment_file_name_parses_back() {
        let name = segment_file_name(42);
        assert_eq!(name, "segment-00000000000000000042.log");
        assert_eq!(parse_segment_file_name(&name), Some(42));
        assert_eq!(parse_segment_file_name("meta.json"), None);
    }

    #[test]
    fn test_open_cuts_torn_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1, 0).unwrap();
        for index in 1..=3 {
            let entry = LogEntry::application(index, 1, 0, Bytes::from(vec![index as u8; 16]));
            segment.append(&entry.encode_frame()).unwrap();
        }
        let path = segment.path.clone();
        let full = segment.size();
        drop(segment);

        // Simulate a crash in the middle of writing the third frame
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 5).unwrap();
        drop(file);

        let opened = Segment::open(&path).unwrap();
        assert!(opened.truncated);
        assert_eq!(opened.entries.len(), 2);
        assert_eq!(opened.entries[1].index, 2);
        assert_eq!(opened.segment.entry_count(), 2);
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(1));
        fs::write(&path, b"not a segment at all, definitely").unwrap();
        assert!(matches!(Segment::open(&path), Err(LogError::Corrupt { .. })));
    }

    #[test]
    fn test_header_keeps_previous_term() {
        let dir = tempfile::TempDir::new().unwrap();
        let segment = Segment::create(dir.path(), 18, 3).unwrap();
        let path = segment.path.clone();
        drop(segment);

        let opened = Segment::open(&path).unwrap();
        assert_eq!(opened.segment.first_index, 18);
        assert_eq!(opened.segment.prev_term, 3);
        assert!(opened.entries.is_empty());
    }
}
