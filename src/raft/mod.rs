//! Consensus module (Layer 3)
//!
//! - `RaftNode`: deterministic per-partition Raft core
//! - `RaftHandle`: the node running as an actor, wired to a transport
//! - `EventBus`: fan-out of committed entries

mod actor;
mod event_bus;
mod message;
mod node;

pub use actor::{RaftActor, RaftHandle, RaftStatus};
pub use event_bus::EventBus;
pub use message::{Envelope, RaftMessage};
pub use node::{AppendError, RaftError, RaftNode, RaftNodeConfig, Ready, Role, RoleChange};
