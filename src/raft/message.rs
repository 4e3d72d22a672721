//! Wire messages of the consensus module

use crate::log::LogEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A consensus message addressed to one member's replica of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub partition: u32,
    pub from: u64,
    pub to: u64,
    pub message: RaftMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest {
        term: u64,
        candidate: u64,
        last_log_index: u64,
        last_log_term: u64,
    },

    VoteResponse {
        term: u64,
        granted: bool,
    },

    /// Replicates entries after `prev_index`; empty `entries` is a heartbeat
    AppendRequest {
        term: u64,
        leader: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    },

    /// `last_log_index` is the highest index known to match (and be flushed)
    /// on success, or a hint where the leader should resume on failure
    AppendResponse {
        term: u64,
        succeeded: bool,
        last_log_index: u64,
        needs_snapshot: bool,
    },

    /// One chunk of a snapshot covering the log up to `index`
    InstallRequest {
        term: u64,
        leader: u64,
        index: u64,
        snapshot_term: u64,
        offset: u64,
        data: Bytes,
        done: bool,
        checksum: String,
    },

    InstallResponse {
        term: u64,
        succeeded: bool,
        next_offset: u64,
    },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendRequest { term, .. }
            | RaftMessage::AppendResponse { term, .. }
            | RaftMessage::InstallRequest { term, .. }
            | RaftMessage::InstallResponse { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendRequest { .. } => "append_request",
            RaftMessage::AppendResponse { .. } => "append_response",
            RaftMessage::InstallRequest { .. } => "install_request",
            RaftMessage::InstallResponse { .. } => "install_response",
        }
    }
}
