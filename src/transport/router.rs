//! Partition router
//!
//! Routes inbound envelopes to the mailbox of the partition they address.

use super::errors::RoutingError;
use crate::raft::Envelope;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Maps partition id to that partition's inbound mailbox
///
/// Routing is synchronous so envelopes from one sender keep their order.
#[derive(Default)]
pub struct PartitionRouter {
    routes: RwLock<HashMap<u32, mpsc::UnboundedSender<Envelope>>>,
}

impl PartitionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_partition(&self, partition: u32, sender: mpsc::UnboundedSender<Envelope>) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.insert(partition, sender);
    }

    pub fn unregister_partition(&self, partition: u32) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.remove(&partition);
    }

    /// Forward an envelope to its partition's mailbox
    pub fn route(&self, envelope: Envelope) -> Result<(), RoutingError> {
        let partition = envelope.partition;
        let sender = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.get(&partition).cloned()
        };

        match sender {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| RoutingError::MailboxClosed { partition }),
            None => Err(RoutingError::PartitionNotFound { partition }),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
