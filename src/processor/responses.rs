use crate::actor::{ActorFuture, FutureError};
use crate::engine::{CommandResponse, RequestMetadata};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pending responses to user commands submitted on this node, keyed by
/// request id
#[derive(Clone)]
pub struct ResponseRegistry {
    node_id: u64,
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, ActorFuture<CommandResponse>>>>,
}

impl ResponseRegistry {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ActorFuture<CommandResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a request id and the future its response completes
    pub fn register(&self) -> (RequestMetadata, ActorFuture<CommandResponse>) {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let future = ActorFuture::new();
        self.lock().insert(request_id, future.clone());
        (
            RequestMetadata {
                node_id: self.node_id,
                request_id,
            },
            future,
        )
    }

    /// Returns false for requests of other nodes or unknown ids
    pub fn complete(&self, request: RequestMetadata, response: CommandResponse) -> bool {
        if request.node_id != self.node_id {
            return false;
        }
        match self.lock().remove(&request.request_id) {
            Some(future) => future.complete(response),
            None => false,
        }
    }

    pub fn fail(&self, request_id: u64, error: FutureError) {
        if let Some(future) = self.lock().remove(&request_id) {
            future.fail(error);
        }
    }

    pub fn fail_all(&self, error: FutureError) {
        let pending: Vec<_> = self.lock().drain().map(|(_, future)| future).collect();
        for future in pending {
            future.fail(error.clone());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
