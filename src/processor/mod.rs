//! Stream processor (Layer 5)
//!
//! Applies committed records to the state store exactly once. The position of
//! the last applied record is written in the same transaction as the state
//! change it belongs to, so after a restart processing resumes right after it
//! and nothing is applied twice.

mod log_stream;
mod responses;
mod stream_processor;

pub use log_stream::LogStream;
pub use responses::ResponseRegistry;
pub use stream_processor::{ErrorPhase, Mode, StreamProcessor, StreamProcessorHandle};

use crate::actor::FutureError;
use crate::engine::{CommandResponse, EngineError, Record};
use crate::retry::Recoverable;
use crate::state::{Family, StateError, StateRead, Transaction, TypedColumnFamily};

/// What processing one command produced
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessingResult {
    /// Events and rejections, written to the log as one batch.
    /// Their state changes are already applied to the transaction.
    pub follow_ups: Vec<Record>,
    /// Response for the submitter of a user command
    pub response: Option<CommandResponse>,
}

/// Business logic driven by the stream processor
pub trait RecordProcessor: Send + 'static {
    /// Process a command inside `txn`
    fn process(&mut self, command: &Record, txn: &mut Transaction) -> Result<ProcessingResult, EngineError>;

    /// Apply the state change of an event written by an earlier leader
    fn replay(&mut self, event: &Record, txn: &mut Transaction) -> Result<(), EngineError>;

    /// Follow-ups for a command whose processing failed unrecoverably.
    /// Runs in a fresh transaction; the failed one was rolled back.
    fn on_processing_error(
        &mut self,
        command: &Record,
        error: &dyn std::error::Error,
        txn: &mut Transaction,
    ) -> Result<ProcessingResult, EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to encode follow-up records: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("follow-up commit aborted: {0}")]
    Future(#[from] FutureError),
}

impl Recoverable for ProcessingError {
    fn is_recoverable(&self) -> bool {
        match self {
            ProcessingError::State(e) => e.is_recoverable(),
            ProcessingError::Engine(e) => e.is_recoverable(),
            ProcessingError::Encode(_) | ProcessingError::Future(_) => false,
        }
    }
}

const POSITIONS: TypedColumnFamily<String, u64> = TypedColumnFamily::new(Family::LastProcessedPosition);
const LAST_PROCESSED: &str = "last_processed_position";

/// Position of the last record applied to `reader`'s state; 0 when none
pub fn last_processed_position(reader: &impl StateRead) -> Result<u64, StateError> {
    Ok(POSITIONS.get(reader, &LAST_PROCESSED.to_string())?.unwrap_or(0))
}

pub(crate) fn write_last_processed_position(txn: &mut Transaction, position: u64) -> Result<(), StateError> {
    POSITIONS.put(txn, &LAST_PROCESSED.to_string(), &position)
}
