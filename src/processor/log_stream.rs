use crate::actor::ActorFuture;
use crate::log::LogEntry;
use crate::raft::RaftHandle;
use crate::snapshot::SnapshotId;
use bytes::Bytes;

/// The processor's view of its partition's replicated log
pub trait LogStream: Send + Sync + 'static {
    /// Up to `max` committed entries starting at `from`
    fn read_committed(&self, from: u64, max: usize) -> ActorFuture<Vec<LogEntry>>;

    /// Append a record batch; resolves with its index once committed
    fn append(&self, data: Bytes) -> ActorFuture<u64>;

    /// Persist state exported at `index` and compact the log up to it
    fn take_snapshot(&self, index: u64, data: Bytes) -> ActorFuture<Option<SnapshotId>>;
}

impl LogStream for RaftHandle {
    fn read_committed(&self, from: u64, max: usize) -> ActorFuture<Vec<LogEntry>> {
        RaftHandle::read_committed(self, from, max)
    }

    fn append(&self, data: Bytes) -> ActorFuture<u64> {
        self.propose(data)
    }

    fn take_snapshot(&self, index: u64, data: Bytes) -> ActorFuture<Option<SnapshotId>> {
        RaftHandle::take_snapshot(self, index, data)
    }
}
