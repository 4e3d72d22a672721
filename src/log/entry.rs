//! Log entries and their on-disk frame encoding.
//!
//! Frame layout (little endian):
//! `[body_len: u32][crc32c(body): u32][body]`
//! with body `[index: u64][term: u64][timestamp: u64][kind: u8][payload...]`.

use bytes::Bytes;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};

pub(crate) const FRAME_HEADER_LEN: usize = 8;
const BODY_FIXED_LEN: usize = 8 + 8 + 8 + 1;

const KIND_INITIAL: u8 = 0;
const KIND_APPLICATION: u8 = 1;

/// Payload of a log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// No-op appended by a new leader when it takes over
    Initial,

    /// Opaque application data (a serialized record batch)
    Application(Bytes),
}

/// One immutable entry of the replicated log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Milliseconds since the Unix epoch, assigned by the leader
    pub timestamp: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn application(index: u64, term: u64, timestamp: u64, data: Bytes) -> Self {
        Self {
            index,
            term,
            timestamp,
            payload: EntryPayload::Application(data),
        }
    }

    pub fn initial(index: u64, term: u64, timestamp: u64) -> Self {
        Self {
            index,
            term,
            timestamp,
            payload: EntryPayload::Initial,
        }
    }

    /// Application bytes, if any
    pub fn data(&self) -> Option<&Bytes> {
        match &self.payload {
            EntryPayload::Application(data) => Some(data),
            EntryPayload::Initial => None,
        }
    }

    pub(crate) fn encode_frame(&self) -> Vec<u8> {
        let payload: &[u8] = match &self.payload {
            EntryPayload::Initial => &[],
            EntryPayload::Application(data) => data.as_ref(),
        };
        let kind = match self.payload {
            EntryPayload::Initial => KIND_INITIAL,
            EntryPayload::Application(_) => KIND_APPLICATION,
        };

        let mut body = Vec::with_capacity(BODY_FIXED_LEN + payload.len());
        body.extend_from_slice(&self.index.to_le_bytes());
        body.extend_from_slice(&self.term.to_le_bytes());
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        body.push(kind);
        body.extend_from_slice(payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

/// Outcome of decoding one frame from a byte buffer
#[derive(Debug)]
pub(crate) enum FrameRead {
    /// A valid entry and the number of bytes it occupied
    Entry(LogEntry, usize),

    /// The buffer ends mid-frame (torn write)
    Torn,

    /// The frame is complete but fails validation
    Corrupt(String),
}

pub(crate) fn decode_frame(bytes: &[u8]) -> FrameRead {
    if bytes.len() < FRAME_HEADER_LEN {
        return FrameRead::Torn;
    }

    let body_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let end = FRAME_HEADER_LEN + body_len;
    if bytes.len() < end {
        return FrameRead::Torn;
    }
    if body_len < BODY_FIXED_LEN {
        return FrameRead::Corrupt(format!("frame body too short: {} bytes", body_len));
    }

    let body = &bytes[FRAME_HEADER_LEN..end];
    let actual_crc = crc32c(body);
    if actual_crc != expected_crc {
        return FrameRead::Corrupt(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected_crc, actual_crc
        ));
    }

    let read_u64 = |offset: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&body[offset..offset + 8]);
        u64::from_le_bytes(buf)
    };
    let index = read_u64(0);
    let term = read_u64(8);
    let timestamp = read_u64(16);
    let payload = match body[24] {
        KIND_INITIAL => EntryPayload::Initial,
        KIND_APPLICATION => EntryPayload::Application(Bytes::copy_from_slice(&body[BODY_FIXED_LEN..])),
        other => return FrameRead::Corrupt(format!("unknown entry kind {}", other)),
    };

    FrameRead::Entry(
        LogEntry {
            index,
            term,
            timestamp,
            payload,
        },
        end,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_decodes_to_same_entry() {
        let entry = LogEntry::application(7, 3, 1_700_000_000_000, Bytes::from_static(b"payload"));
        let frame = entry.encode_frame();
        match decode_frame(&frame) {
            FrameRead::Entry(decoded, len) => {
                assert_eq!(decoded, entry);
                assert_eq!(len, frame.len());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_is_torn() {
        let frame = LogEntry::initial(1, 1, 0).encode_frame();
        assert!(matches!(decode_frame(&frame[..frame.len() - 1]), FrameRead::Torn));
        assert!(matches!(decode_frame(&frame[..3]), FrameRead::Torn));
    }

    #[test]
    fn test_flipped_bit_is_corrupt() {
        let mut frame = LogEntry::application(1, 1, 0, Bytes::from_static(b"abc")).encode_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(decode_frame(&frame), FrameRead::Corrupt(_)));
    }
}
