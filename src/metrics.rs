//! Per-partition counters and gauges.
//!
//! A `PartitionMetrics` is created by the partition and handed to each
//! component that reports into it. Reads never block writers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Role gauge values
pub const ROLE_INACTIVE: u64 = 0;
pub const ROLE_FOLLOWER: u64 = 1;
pub const ROLE_CANDIDATE: u64 = 2;
pub const ROLE_LEADER: u64 = 3;

#[derive(Debug, Default)]
pub struct PartitionMetrics {
    partition: u32,
    appended: AtomicU64,
    committed: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    flush_failures: AtomicU64,
    elections: AtomicU64,
    snapshots: AtomicU64,
    commit_index: AtomicU64,
    last_processed_position: AtomicU64,
    blacklist_size: AtomicU64,
    role: AtomicU64,
}

/// Point-in-time copy of a partition's metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub partition: u32,
    pub appended: u64,
    pub committed: u64,
    pub applied: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub retries: u64,
    pub flush_failures: u64,
    pub elections: u64,
    pub snapshots: u64,
    pub commit_index: u64,
    pub last_processed_position: u64,
    pub blacklist_size: u64,
    pub role: u64,
}

impl PartitionMetrics {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn record_appended(&self, count: u64) {
        self.appended.fetch_add(count, Ordering::Relaxed);
    }

    /// Count newly committed entries and move the commit gauge
    pub fn record_committed(&self, count: u64, commit_index: u64) {
        self.committed.fetch_add(count, Ordering::Relaxed);
        self.commit_index.fetch_max(commit_index, Ordering::Relaxed);
    }

    pub fn record_applied(&self, position: u64) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.last_processed_position.fetch_max(position, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, position: u64) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.last_processed_position.fetch_max(position, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_election(&self) {
        self.elections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    /// Restored state jumps the position gauge directly
    pub fn set_last_processed_position(&self, position: u64) {
        self.last_processed_position.store(position, Ordering::Relaxed);
    }

    pub fn set_blacklist_size(&self, size: u64) {
        self.blacklist_size.store(size, Ordering::Relaxed);
    }

    pub fn set_role(&self, role: u64) {
        self.role.store(role, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            partition: self.partition,
            appended: self.appended.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            elections: self.elections.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
            commit_index: self.commit_index.load(Ordering::Relaxed),
            last_processed_position: self.last_processed_position.load(Ordering::Relaxed),
            blacklist_size: self.blacklist_size.load(Ordering::Relaxed),
            role: self.role.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_only_move_forward_on_record() {
        let metrics = PartitionMetrics::new(3);
        metrics.record_committed(2, 10);
        metrics.record_committed(1, 7);
        metrics.record_applied(5);
        metrics.record_applied(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.partition, 3);
        assert_eq!(snapshot.committed, 3);
        assert_eq!(snapshot.commit_index, 10);
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.last_processed_position, 5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = PartitionMetrics::new(1);
        metrics.record_retry();
        metrics.set_role(ROLE_LEADER);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["retries"], 1);
        assert_eq!(json["role"], ROLE_LEADER);
    }
}
