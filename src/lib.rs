//! Replicated stream processing core.
//!
//! Each partition is a replicated state machine built from these layers:
//! - Layer 0: Actor runtime (cooperative actors on CPU and I/O pools, futures)
//! - Layer 1: Replicated log (segmented, checksummed, explicit flush)
//! - Layer 2: Transport and partition routing
//! - Layer 3: Raft consensus (election, quorum-flush commit, snapshot install)
//! - Layer 4: State store (RocksDB column families behind single-writer transactions)
//! - Layer 5: Stream processor (exactly-once application of committed records)
//! - Layer 6: Partition and broker facades (submit, subscribe, query, gossip)

pub mod actor;
pub mod blacklist;
pub mod broker;
pub mod config;
pub mod engine;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod partition;
pub mod processor;
pub mod raft;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use actor::{collect, Actor, ActorControl, ActorFuture, ActorScheduler, FutureError};
pub use broker::Broker;
pub use config::BrokerConfig;
pub use engine::{Command, CommandResponse, Record, RecordValue};
pub use metrics::{MetricsSnapshot, PartitionMetrics};
pub use partition::Partition;
pub use raft::{RaftNode, RoleChange};
