//! Member-to-member messaging (Layer 2)
//!
//! From the wire inwards:
//! - `InProcessServer` moves bytes between brokers of one process
//! - `TransportLayer` keeps the peer registry and encodes envelopes
//! - `PartitionRouter` hands inbound envelopes to partition mailboxes

mod errors;
mod in_process;
mod layer;
mod router;

pub use errors::{RoutingError, TransportError};
pub use in_process::{InProcessMessageSender, InProcessServer};
pub use layer::{decode_envelope, encode_envelope, MessageSender, Transport, TransportLayer};
pub use router::PartitionRouter;
