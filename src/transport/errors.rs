//! Error types of the transport and routing layers

/// Errors moving an envelope from one member to another
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("no address known for node {node_id}")]
    PeerNotFound { node_id: u64 },

    #[error("failed to encode envelope: {reason}")]
    SerializationError { reason: String },

    #[error("failed to decode envelope: {reason}")]
    DeserializationError { reason: String },

    /// The address does not follow the `node:<id>` scheme
    #[error("invalid in-process address '{address}'")]
    InvalidAddress { address: String },

    /// Delivered, but the receiving member could not hand it to a partition
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Errors handing an inbound envelope to its partition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("partition {partition} is not hosted here")]
    PartitionNotFound { partition: u32 },

    #[error("mailbox of partition {partition} is closed")]
    MailboxClosed { partition: u32 },
}
