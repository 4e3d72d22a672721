//! Partition facade (Layer 6)
//!
//! Opens everything one replica of a partition needs (log, term/vote
//! metadata, snapshots, state store), starts the raft and stream processor
//! actors and wires them together:
//! - committed entries and role changes of the raft actor drive the processor
//! - committed records are fanned out to subscribers through an `EventBus`
//! - submitted commands are proposed to raft and answered by the processor

use crate::actor::{ActorFuture, ActorScheduler, FutureError};
use crate::blacklist::Blacklist;
use crate::config::{BrokerConfig, FlushPolicy};
use crate::engine::{
    Command, CommandResponse, DeploymentRecord, Engine, ProcessInstance, Record, RecordBatch,
};
use crate::log::{FaultyFlusher, FlushFaults, Flusher, LogError, MetaStore, RaftLog, SyncFlusher};
use crate::metrics::{MetricsSnapshot, PartitionMetrics};
use crate::processor::{
    last_processed_position, ErrorPhase, LogStream, Mode, ResponseRegistry, StreamProcessor,
    StreamProcessorHandle,
};
use crate::raft::{EventBus, RaftHandle, RaftNode, RaftNodeConfig, RaftStatus, Role};
use crate::snapshot::{SnapshotError, SnapshotId, SnapshotStore};
use crate::state::{StateDb, StateError};
use crate::transport::{PartitionRouter, Transport};
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const RECORD_BUS_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("failed to open log: {0}")]
    Log(#[from] LogError),

    #[error("failed to open raft metadata: {0}")]
    Meta(#[from] std::io::Error),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to start partition actors: {0}")]
    Startup(#[from] FutureError),
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One replica of a partition, running on this node
pub struct Partition {
    id: u32,
    node_id: u64,
    raft: RaftHandle,
    processor: StreamProcessorHandle<Engine>,
    responses: ResponseRegistry,
    records: Arc<EventBus<Record>>,
    metrics: Arc<PartitionMetrics>,
    faults: Option<FlushFaults>,
    router: Arc<PartitionRouter>,
    record_pump: JoinHandle<()>,
    logger: Logger,
}

impl Partition {
    /// Open the partition's storage under `config.partition_dir(id)` and
    /// start its actors. Inbound raft messages arrive through `router`.
    pub async fn open(
        config: &BrokerConfig,
        id: u32,
        transport: Arc<dyn Transport>,
        router: Arc<PartitionRouter>,
        scheduler: &ActorScheduler,
        logger: Logger,
    ) -> Result<Self, PartitionError> {
        let logger = logger.new(o!("partition" => id));
        let dir = config.partition_dir(id);
        let metrics = Arc::new(PartitionMetrics::new(id));

        let (flusher, faults): (Arc<dyn Flusher>, Option<FlushFaults>) = match config.log.flush {
            FlushPolicy::Sync => (Arc::new(SyncFlusher), None),
            FlushPolicy::Faulty => {
                let faults = FlushFaults::new();
                (Arc::new(FaultyFlusher::new(faults.clone())), Some(faults))
            }
        };
        let log = RaftLog::open(dir.join("log"), &config.log, flusher, logger.clone())?;
        let meta = MetaStore::open(dir.join("meta"))?;
        let snapshots = SnapshotStore::open(dir.join("snapshots"), logger.clone())?;
        let latest_snapshot = snapshots.latest().cloned();

        let state = StateDb::open(dir.join("state"), logger.clone())?;
        if let Some(snapshot) = &latest_snapshot {
            let position = last_processed_position(&state)?;
            if snapshot.id.index > position {
                info!(logger, "Restoring state from snapshot";
                    "snapshot_index" => snapshot.id.index, "last_processed_position" => position);
                state.restore(&snapshot.data)?;
            }
        }

        let node_config = RaftNodeConfig::new(config.node_id, id, config.cluster.clone())
            .with_priority(config.priority_of(config.node_id), config.cluster.len() as u32)
            .with_seed(config.node_id ^ ((id as u64) << 32))
            .with_raft(config.raft.clone());
        let node = RaftNode::new(
            node_config,
            log,
            meta,
            snapshots,
            logger.clone(),
            metrics.clone(),
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        router.register_partition(id, inbound_tx);
        let raft = RaftHandle::spawn(
            node,
            config.raft.tick_interval,
            config.retry.backoff,
            transport,
            inbound_rx,
            scheduler,
            logger.clone(),
        );

        let blacklist = Blacklist::new(metrics.clone(), logger.clone());
        let engine = Engine::new(
            id,
            blacklist.clone(),
            config.processor.usage_metrics_interval,
            logger.clone(),
        );
        let responses = ResponseRegistry::new(config.node_id);
        let log_stream: Arc<dyn LogStream> = Arc::new(raft.clone());
        let processor = StreamProcessor::new(
            id,
            engine,
            state,
            log_stream,
            blacklist,
            responses.clone(),
            metrics.clone(),
            config.processor.clone(),
            latest_snapshot.map(|snapshot| snapshot.id.index).unwrap_or(0),
            logger.clone(),
        )?;
        let processor = StreamProcessorHandle::spawn(processor, scheduler);

        // Registered before the first election can complete
        let on_commit = processor.clone();
        raft.on_commit(move |index| on_commit.notify_commit(index)).await?;
        let on_role = processor.clone();
        raft.on_role_change(move |change| on_role.notify_role_change(change.clone()))
            .await?;
        let on_snapshot = processor.clone();
        raft.on_snapshot_installed(move |snapshot| on_snapshot.notify_snapshot_installed(snapshot.clone()))
            .await?;

        let records = Arc::new(EventBus::new(RECORD_BUS_CAPACITY));
        let record_pump = scheduler.spawn_io(pump_records(
            raft.subscribe_committed(),
            records.clone(),
            logger.clone(),
        ));

        info!(logger, "Partition opened"; "node" => config.node_id, "dir" => dir.display().to_string());

        Ok(Self {
            id,
            node_id: config.node_id,
            raft,
            processor,
            responses,
            records,
            metrics,
            faults,
            router,
            record_pump,
            logger,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    /// Submit a command; resolves once its follow-ups are committed and
    /// applied. Fails if this replica is not the leader.
    pub fn submit(&self, command: Command) -> ActorFuture<CommandResponse> {
        let (request, response) = self.responses.register();
        let mut record = command.into_record();
        record.request = Some(request);
        record.timestamp = now_millis();

        let data = match RecordBatch::new(vec![record]).encode() {
            Ok(data) => data,
            Err(e) => {
                self.responses.fail(request.request_id, FutureError::failed(e));
                return response;
            }
        };

        let responses = self.responses.clone();
        self.raft.propose(data).on_complete(move |outcome| {
            if let Err(error) = outcome {
                responses.fail(request.request_id, error.clone());
            }
        });
        response
    }

    /// Records of entries committed from now on. Subscribers that fall behind
    /// observe `Lagged` and catch up with `read_committed`.
    pub fn subscribe(&self) -> broadcast::Receiver<Record> {
        self.records.subscribe()
    }

    /// Committed records of up to `max` entries starting at position `from`
    pub fn read_committed(&self, from: u64, max: usize) -> ActorFuture<Vec<Record>> {
        self.raft.read_committed(from, max).then(|entries| {
            let mut records = Vec::new();
            for entry in &entries {
                match RecordBatch::decode(entry) {
                    Ok(batch) => records.extend(batch),
                    Err(e) => return ActorFuture::failed(FutureError::failed(e)),
                }
            }
            ActorFuture::completed(records)
        })
    }

    fn query<R, F>(&self, f: F) -> ActorFuture<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(&StateDb, &Blacklist) -> Result<R, StateError> + Send + 'static,
    {
        self.processor
            .query(move |state, blacklist| f(state, blacklist).map_err(FutureError::failed))
            .then(|outcome| match outcome {
                Ok(value) => ActorFuture::completed(value),
                Err(error) => ActorFuture::failed(error),
            })
    }

    pub fn deployment(&self, process_id: impl Into<String>) -> ActorFuture<Option<DeploymentRecord>> {
        let process_id = process_id.into();
        self.query(move |state, _| Engine::deployment(state, &process_id))
    }

    pub fn instance(&self, key: u64) -> ActorFuture<Option<ProcessInstance>> {
        self.query(move |state, _| Engine::instance(state, key))
    }

    pub fn instances(&self) -> ActorFuture<Vec<ProcessInstance>> {
        self.query(|state, _| Engine::instances(state))
    }

    pub fn is_blacklisted(&self, key: u64) -> ActorFuture<bool> {
        self.query(move |state, blacklist| blacklist.is_blacklisted(state, key))
    }

    pub fn banned_instances(&self) -> ActorFuture<Vec<u64>> {
        self.query(|state, blacklist| blacklist.banned(state))
    }

    pub fn last_processed_position(&self) -> ActorFuture<u64> {
        self.processor.last_processed_position()
    }

    pub fn is_making_progress(&self) -> ActorFuture<bool> {
        self.processor.is_making_progress()
    }

    pub fn processor_phase(&self) -> ActorFuture<ErrorPhase> {
        self.processor.phase()
    }

    pub fn processor_mode(&self) -> ActorFuture<Mode> {
        self.processor.mode()
    }

    /// Snapshot the state at the last processed position and compact the log
    pub fn take_snapshot(&self) -> ActorFuture<Option<SnapshotId>> {
        self.processor.take_snapshot()
    }

    pub fn status(&self) -> ActorFuture<RaftStatus> {
        self.raft.status()
    }

    pub fn role(&self) -> ActorFuture<Role> {
        self.raft.status().map(|status| status.role)
    }

    pub fn campaign(&self) -> ActorFuture<()> {
        self.raft.campaign()
    }

    pub fn metrics(&self) -> &Arc<PartitionMetrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fault switch of the log flusher, present with `FlushPolicy::Faulty`
    pub fn flush_faults(&self) -> Option<&FlushFaults> {
        self.faults.as_ref()
    }

    /// Stop the processor, then raft. Pending responses fail with `ActorClosed`.
    pub async fn close(&self) {
        self.router.unregister_partition(self.id);
        if let Err(e) = self.processor.close().await {
            warn!(self.logger, "Stream processor did not close cleanly"; "error" => %e);
        }
        if let Err(e) = self.raft.close().await {
            warn!(self.logger, "Raft actor did not close cleanly"; "error" => %e);
        }
        self.record_pump.abort();
        info!(self.logger, "Partition closed");
    }
}

async fn pump_records(
    mut committed: broadcast::Receiver<crate::log::LogEntry>,
    records: Arc<EventBus<Record>>,
    logger: Logger,
) {
    loop {
        match committed.recv().await {
            Ok(entry) => match RecordBatch::decode(&entry) {
                Ok(batch) => {
                    records.publish_batch(batch);
                }
                Err(e) => {
                    warn!(logger, "Committed entry holds no record batch"; "index" => entry.index, "error" => %e);
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(logger, "Record feed fell behind the log"; "skipped" => skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
