//! Configuration for raftstream brokers
//!
//! Every section carries serde defaults so a JSON file only needs to name the
//! values it overrides.

use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors loading or validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter storing a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Timing and batching of the consensus module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Ticks without leader contact before a follower campaigns (default: 10)
    pub election_tick: u64,

    /// Ticks between leader heartbeats (default: 3)
    pub heartbeat_tick: u64,

    /// Wall-clock length of one tick (default: 100ms)
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,

    /// Maximum entries per append request (default: 64)
    pub max_append_batch: usize,

    /// Bytes per snapshot install chunk (default: 64 KiB)
    pub snapshot_chunk_size: usize,

    /// Local append attempts before a leader gives up and steps down (default: 5)
    pub max_append_attempts: u32,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 3,
            tick_interval: Duration::from_millis(100),
            max_append_batch: 64,
            snapshot_chunk_size: 64 * 1024,
            max_append_attempts: 5,
        }
    }
}

impl RaftConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_election_tick(mut self, election_tick: u64) -> Self {
        self.election_tick = election_tick;
        self
    }

    pub fn with_snapshot_chunk_size(mut self, snapshot_chunk_size: usize) -> Self {
        self.snapshot_chunk_size = snapshot_chunk_size;
        self
    }
}

/// How log segments reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// `fdatasync` every flush
    Sync,

    /// Like `Sync`, but failures can be injected at runtime
    Faulty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A segment rolls over once it would grow beyond this (default: 4 MiB)
    pub segment_max_bytes: u64,
    pub flush: FlushPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 4 * 1024 * 1024,
            flush: FlushPolicy::Sync,
        }
    }
}

impl LogConfig {
    pub fn with_segment_max_bytes(mut self, segment_max_bytes: u64) -> Self {
        self.segment_max_bytes = segment_max_bytes;
        self
    }

    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }
}

/// Stream processor tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Committed entries read from the log per processing round (default: 100)
    pub max_commands_in_batch: usize,

    /// Take a snapshot after this many processed entries; 0 disables it (default: 1000)
    pub snapshot_period: u64,

    /// Delay before retrying a recoverable processing error (default: 250ms)
    #[serde(with = "duration_ms")]
    pub processing_retry_delay: Duration,

    /// Width of a usage metrics bucket (default: 5 minutes)
    #[serde(with = "duration_ms")]
    pub usage_metrics_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_commands_in_batch: 100,
            snapshot_period: 1000,
            processing_retry_delay: Duration::from_millis(250),
            usage_metrics_interval: Duration::from_secs(300),
        }
    }
}

impl ProcessorConfig {
    pub fn with_snapshot_period(mut self, snapshot_period: u64) -> Self {
        self.snapshot_period = snapshot_period;
        self
    }

    pub fn with_processing_retry_delay(mut self, delay: Duration) -> Self {
        self.processing_retry_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff: BackoffConfig,
}

/// Configuration of one broker (cluster member)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// This member's id; must appear in `cluster`
    pub node_id: u64,

    /// Ids of all members, in priority order (first is most preferred as leader)
    pub cluster: Vec<u64>,

    /// Number of partitions; partition ids are 1..=partitions
    pub partitions: u32,

    /// Root directory for logs, state and snapshots
    pub data_dir: PathBuf,

    /// CPU-bound worker threads of the actor scheduler
    pub cpu_threads: usize,

    /// I/O-bound worker threads of the actor scheduler
    pub io_threads: usize,

    pub raft: RaftConfig,
    pub log: LogConfig,
    pub processor: ProcessorConfig,
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster: vec![1],
            partitions: 1,
            data_dir: PathBuf::from("data"),
            cpu_threads: 2,
            io_threads: 2,
            raft: RaftConfig::default(),
            log: LogConfig::default(),
            processor: ProcessorConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn new(node_id: u64, cluster: Vec<u64>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            cluster,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: BrokerConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.is_empty() {
            return Err(ConfigError::Invalid("cluster must list at least one member".into()));
        }
        if !self.cluster.contains(&self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node {} is not a member of cluster {:?}",
                self.node_id, self.cluster
            )));
        }
        let mut members = self.cluster.clone();
        members.sort_unstable();
        members.dedup();
        if members.len() != self.cluster.len() {
            return Err(ConfigError::Invalid("cluster lists a member twice".into()));
        }
        if self.partitions == 0 {
            return Err(ConfigError::Invalid("at least one partition is required".into()));
        }
        if self.raft.heartbeat_tick == 0 || self.raft.election_tick <= self.raft.heartbeat_tick {
            return Err(ConfigError::Invalid(
                "election_tick must be greater than a non-zero heartbeat_tick".into(),
            ));
        }
        if self.raft.snapshot_chunk_size == 0 || self.raft.max_append_batch == 0 {
            return Err(ConfigError::Invalid("raft batch sizes must be non-zero".into()));
        }
        if self.retry.backoff.initial > self.retry.backoff.max {
            return Err(ConfigError::Invalid("backoff initial delay exceeds its maximum".into()));
        }
        Ok(())
    }

    /// Election priority of a member: earlier members in `cluster` rank higher
    pub fn priority_of(&self, node_id: u64) -> u32 {
        let count = self.cluster.len() as u32;
        self.cluster
            .iter()
            .position(|id| *id == node_id)
            .map(|position| count - position as u32)
            .unwrap_or(0)
    }

    pub fn partition_dir(&self, partition: u32) -> PathBuf {
        self.data_dir
            .join(format!("node-{}", self.node_id))
            .join(format!("partition-{}", partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.raft.election_tick, 10);
        assert_eq!(config.raft.heartbeat_tick, 3);
        assert_eq!(config.raft.tick_interval, Duration::from_millis(100));
        assert_eq!(config.retry.backoff.initial, Duration::from_secs(1));
        assert_eq!(config.retry.backoff.max, Duration::from_secs(8));
        assert_eq!(config.processor.processing_retry_delay, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broker.json");
        std::fs::write(
            &path,
            r#"{ "node_id": 2, "cluster": [1, 2, 3], "raft": { "tick_interval": 20 } }"#,
        )
        .unwrap();

        let config = BrokerConfig::load(&path).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.raft.tick_interval, Duration::from_millis(20));
        assert_eq!(config.raft.election_tick, 10);
        assert_eq!(config.log.flush, FlushPolicy::Sync);
    }

    #[test]
    fn test_validate_rejects_foreign_node() {
        let config = BrokerConfig::new(4, vec![1, 2, 3], "data");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_priority_follows_cluster_order() {
        let config = BrokerConfig::new(1, vec![1, 2, 3], "data");
        assert_eq!(config.priority_of(1), 3);
        assert_eq!(config.priority_of(3), 1);
        assert_eq!(config.priority_of(9), 0);
    }
}
