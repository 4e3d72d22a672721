//! Protocol-agnostic transport layer
//!
//! Envelopes are encoded to JSON bytes here; the protocol-specific
//! `MessageSender` only moves bytes to an address.

use super::errors::TransportError;
use super::router::PartitionRouter;
use crate::raft::Envelope;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Protocol-specific byte sender
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    /// Send an encoded envelope to a peer at the given address
    async fn send(&self, address: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// Sends envelopes to members and hands inbound ones to the local router
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Decode an inbound payload and route it to its partition
    async fn receive_message(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn add_peer(&self, node_id: u64, address: String);

    async fn remove_peer(&self, node_id: u64);

    async fn list_peers(&self) -> Vec<u64>;

    async fn get_peer_address(&self, node_id: u64) -> Option<String>;
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, TransportError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| TransportError::SerializationError {
            reason: e.to_string(),
        })
}

pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::DeserializationError {
        reason: e.to_string(),
    })
}

/// Peer registry plus a `MessageSender` and the local `PartitionRouter`
pub struct TransportLayer {
    /// node_id → address
    peers: Arc<Mutex<HashMap<u64, String>>>,

    message_sender: Arc<dyn MessageSender>,

    router: Arc<PartitionRouter>,
}

impl TransportLayer {
    pub fn new(message_sender: Arc<dyn MessageSender>, router: Arc<PartitionRouter>) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            message_sender,
            router,
        }
    }

    pub fn router(&self) -> &Arc<PartitionRouter> {
        &self.router
    }

    /// Synchronous inbound path, used by in-process delivery to keep order
    pub fn deliver(&self, payload: &[u8]) -> Result<(), TransportError> {
        let envelope = decode_envelope(payload)?;
        self.router.route(envelope)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for TransportLayer {
    async fn send_message(&self, envelope: Envelope) -> Result<(), TransportError> {
        let target = envelope.to;
        let address = {
            let peers = self.peers.lock().await;
            peers.get(&target).cloned()
        };

        match address {
            Some(address) => {
                let payload = encode_envelope(&envelope)?;
                self.message_sender.send(&address, payload).await
            }
            None => Err(TransportError::PeerNotFound { node_id: target }),
        }
    }

    async fn receive_message(&self, payload: Bytes) -> Result<(), TransportError> {
        self.deliver(&payload)
    }

    async fn add_peer(&self, node_id: u64, address: String) {
        let mut peers = self.peers.lock().await;
        peers.insert(node_id, address);
    }

    async fn remove_peer(&self, node_id: u64) {
        let mut peers = self.peers.lock().await;
        peers.remove(&node_id);
    }

    async fn list_peers(&self) -> Vec<u64> {
        let peers = self.peers.lock().await;
        let mut ids: Vec<u64> = peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn get_peer_address(&self, node_id: u64) -> Option<String> {
        let peers = self.peers.lock().await;
        peers.get(&node_id).cloned()
    }
}
