//! Actor runtime (Layer 0)
//!
//! Cooperative actors scheduled on bounded CPU and I/O pools, communicating
//! through completion-callback futures.

pub mod future;
pub mod scheduler;

pub use future::{collect, ActorFuture, FutureError};
pub use scheduler::{Actor, ActorControl, ActorScheduler, PoolKind, ScheduledTimer, SchedulerConfig};
