//! In-process server
//!
//! Routes encoded envelopes between brokers of one process without network
//! I/O. Nodes can be isolated to simulate a network partition: traffic to or
//! from an isolated node is silently dropped, like a lost packet.

use super::errors::TransportError;
use super::layer::MessageSender;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

type Receiver = Arc<dyn Fn(Bytes) -> Result<(), TransportError> + Send + Sync>;

#[derive(Default)]
pub struct InProcessServer {
    nodes: Mutex<HashMap<u64, Receiver>>,
    isolated: Mutex<HashSet<u64>>,
}

impl InProcessServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback receiving payloads addressed to `node_id`
    pub fn register_node<F>(&self, node_id: u64, callback: F)
    where
        F: Fn(Bytes) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node_id, Arc::new(callback));
    }

    pub fn unregister_node(&self, node_id: u64) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.remove(&node_id);
    }

    /// Cut a node off from all others until `reconnect`
    pub fn isolate(&self, node_id: u64) {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id);
    }

    pub fn reconnect(&self, node_id: u64) {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node_id);
    }

    fn is_isolated(&self, node_id: u64) -> bool {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&node_id)
    }

    /// Deliver a payload from `from` to `target`
    pub fn send_to_node(&self, from: u64, target: u64, payload: Bytes) -> Result<(), TransportError> {
        if self.is_isolated(from) || self.is_isolated(target) {
            return Ok(());
        }

        let callback = {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes.get(&target).cloned()
        };
        match callback {
            Some(callback) => callback(payload),
            None => Err(TransportError::PeerNotFound { node_id: target }),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// `MessageSender` over an `InProcessServer`, addressing peers as `node:<id>`
pub struct InProcessMessageSender {
    server: Arc<InProcessServer>,
    local_node: u64,
}

impl InProcessMessageSender {
    pub fn new(server: Arc<InProcessServer>, local_node: u64) -> Self {
        Self { server, local_node }
    }

    pub fn address_of(node_id: u64) -> String {
        format!("node:{}", node_id)
    }

    fn parse_node_id(address: &str) -> Result<u64, TransportError> {
        address
            .strip_prefix("node:")
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::InvalidAddress {
                address: address.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl MessageSender for InProcessMessageSender {
    async fn send(&self, address: &str, payload: Bytes) -> Result<(), TransportError> {
        let node_id = Self::parse_node_id(address)?;
        self.server.send_to_node(self.local_node, node_id, payload)
    }
}
