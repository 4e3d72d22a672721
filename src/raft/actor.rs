//! Runs a `RaftNode` as an actor on the I/O pool.
//!
//! The node is ticked at a fixed rate and stepped with inbound envelopes on
//! the actor's own context. After every interaction the accumulated `Ready`
//! is drained: outbound envelopes go to a sender task, committed entries and
//! role changes go to subscribers and registered listeners.

use super::event_bus::EventBus;
use super::message::Envelope;
use super::node::{RaftError, RaftNode, Role, RoleChange};
use crate::actor::{Actor, ActorControl, ActorFuture, ActorScheduler, PoolKind, ScheduledTimer};
use crate::log::LogEntry;
use crate::retry::{BackoffConfig, RetryStrategy};
use crate::snapshot::{Snapshot, SnapshotId};
use crate::transport::Transport;
use bytes::Bytes;
use slog::{debug, info, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

type CommitListener = Box<dyn Fn(u64) + Send>;
type RoleListener = Box<dyn Fn(&RoleChange) + Send>;
type SnapshotListener = Box<dyn Fn(&Snapshot) + Send>;

/// Point-in-time view of a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub node_id: u64,
    pub role: Role,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub flushed_index: u64,
}

pub struct RaftActor {
    node: RaftNode,
    outbound: mpsc::UnboundedSender<Envelope>,
    committed: Arc<EventBus<LogEntry>>,
    roles: broadcast::Sender<RoleChange>,
    commit_listeners: Vec<CommitListener>,
    role_listeners: Vec<RoleListener>,
    snapshot_listeners: Vec<SnapshotListener>,
    tick_interval: Duration,
    ticker: Option<ScheduledTimer>,
    /// Persisting a snapshot touches the disk and backs off on I/O errors
    snapshot_retry: RetryStrategy,
    logger: Logger,
}

impl Actor for RaftActor {
    fn name(&self) -> String {
        format!("raft-{}-{}", self.node.partition(), self.node.id())
    }

    fn on_started(&mut self, control: &ActorControl<Self>) {
        let timer = control.run_at_fixed_rate(self.tick_interval, |actor: &mut RaftActor, _| {
            actor.node.tick();
            actor.drain_ready();
        });
        self.ticker = Some(timer);
    }

    fn on_closing(&mut self, _control: &ActorControl<Self>) {
        if let Some(timer) = self.ticker.take() {
            timer.cancel();
        }
        info!(self.logger, "Raft actor closing"; "term" => self.node.term(), "commit_index" => self.node.commit_index());
    }
}

impl RaftActor {
    pub fn node(&self) -> &RaftNode {
        &self.node
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.node.id(),
            role: self.node.role(),
            term: self.node.term(),
            leader: self.node.leader(),
            commit_index: self.node.commit_index(),
            first_index: self.node.log().first_index(),
            last_index: self.node.log().last_index(),
            flushed_index: self.node.log().flushed_index(),
        }
    }

    fn step(&mut self, envelope: Envelope) {
        self.node.step(envelope);
        self.drain_ready();
    }

    fn propose(&mut self, data: Bytes) -> ActorFuture<u64> {
        let future = self.node.propose(data);
        self.drain_ready();
        future
    }

    fn campaign(&mut self) {
        self.node.campaign();
        self.drain_ready();
    }

    /// One attempt at persisting a snapshot; completes `taken` on success
    fn try_snapshot(
        &mut self,
        index: u64,
        data: &Bytes,
        taken: &ActorFuture<Option<SnapshotId>>,
    ) -> Result<bool, RaftError> {
        let id = self.node.take_snapshot(index, data.clone())?;
        taken.complete(id);
        Ok(true)
    }

    fn drain_ready(&mut self) {
        let ready = self.node.take_ready();
        if ready.is_empty() {
            return;
        }

        for envelope in ready.messages {
            let _ = self.outbound.send(envelope);
        }
        if let Some(snapshot) = &ready.installed_snapshot {
            for listener in &self.snapshot_listeners {
                listener(snapshot);
            }
        }
        for change in ready.role_changes {
            debug!(self.logger, "Role change"; "change" => ?change);
            let _ = self.roles.send(change.clone());
            for listener in &self.role_listeners {
                listener(&change);
            }
        }
        if !ready.committed.is_empty() {
            let commit_index = self.node.commit_index();
            self.committed.publish_batch(ready.committed);
            for listener in &self.commit_listeners {
                listener(commit_index);
            }
        }
    }
}

/// Cloneable handle to a running `RaftActor`
#[derive(Clone)]
pub struct RaftHandle {
    control: ActorControl<RaftActor>,
    committed: Arc<EventBus<LogEntry>>,
    roles: broadcast::Sender<RoleChange>,
}

impl RaftHandle {
    /// Start the actor, its outbound sender task and its inbound pump
    pub fn spawn(
        node: RaftNode,
        tick_interval: Duration,
        snapshot_backoff: BackoffConfig,
        transport: Arc<dyn Transport>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        scheduler: &ActorScheduler,
        logger: Logger,
    ) -> Self {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let committed = Arc::new(EventBus::new(4096));
        let (roles, _) = broadcast::channel(64);

        let actor = RaftActor {
            node,
            outbound,
            committed: committed.clone(),
            roles: roles.clone(),
            commit_listeners: Vec::new(),
            role_listeners: Vec::new(),
            snapshot_listeners: Vec::new(),
            tick_interval,
            ticker: None,
            snapshot_retry: RetryStrategy::backoff(snapshot_backoff, logger.clone()),
            logger: logger.clone(),
        };
        let control = scheduler.submit_actor(actor, PoolKind::Io);

        let send_logger = logger.clone();
        scheduler.spawn_io(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let to = envelope.to;
                let kind = envelope.message.kind();
                if let Err(e) = transport.send_message(envelope).await {
                    debug!(send_logger, "Failed to send raft message"; "to" => to, "kind" => kind, "error" => %e);
                }
            }
        });

        let pump = control.clone();
        scheduler.spawn_io(async move {
            while let Some(envelope) = inbound.recv().await {
                if pump.submit(move |actor, _| actor.step(envelope)).is_err() {
                    break;
                }
            }
        });

        Self {
            control,
            committed,
            roles,
        }
    }

    pub fn control(&self) -> &ActorControl<RaftActor> {
        &self.control
    }

    /// Append `data`; resolves with the entry's index once committed
    pub fn propose(&self, data: Bytes) -> ActorFuture<u64> {
        self.control.call(move |actor, _| actor.propose(data)).then(|future| future)
    }

    pub fn campaign(&self) -> ActorFuture<()> {
        self.control.call(|actor, _| actor.campaign())
    }

    pub fn status(&self) -> ActorFuture<RaftStatus> {
        self.control.call(|actor, _| actor.status())
    }

    pub fn read_committed(&self, from: u64, max: usize) -> ActorFuture<Vec<LogEntry>> {
        self.control.call(move |actor, _| actor.node.read_committed(from, max))
    }

    pub fn latest_snapshot(&self) -> ActorFuture<Option<Snapshot>> {
        self.control.call(|actor, _| actor.node.latest_snapshot().cloned())
    }

    /// Persist a snapshot at `index` and compact the log up to it. I/O
    /// failures are retried with backoff; `None` if a newer snapshot exists.
    pub fn take_snapshot(&self, index: u64, data: Bytes) -> ActorFuture<Option<SnapshotId>> {
        let taken = ActorFuture::new();
        let result = taken.clone();
        let submitted = self.control.submit(move |actor, control| {
            let failed = taken.clone();
            let retry = actor.snapshot_retry.clone();
            retry
                .run_with_retry(
                    control,
                    move |actor: &mut RaftActor| actor.try_snapshot(index, &data, &taken),
                    |_: &RaftActor| false,
                )
                .on_complete(move |outcome| {
                    if let Err(error) = outcome {
                        failed.fail(error.clone());
                    }
                });
        });
        if let Err(error) = submitted {
            result.fail(error);
        }
        result
    }

    pub fn subscribe_committed(&self) -> broadcast::Receiver<LogEntry> {
        self.committed.subscribe()
    }

    pub fn subscribe_role_changes(&self) -> broadcast::Receiver<RoleChange> {
        self.roles.subscribe()
    }

    /// Call `listener` with the commit index whenever entries commit
    pub fn on_commit<F>(&self, listener: F) -> ActorFuture<()>
    where
        F: Fn(u64) + Send + 'static,
    {
        self.control
            .call(move |actor, _| actor.commit_listeners.push(Box::new(listener)))
    }

    pub fn on_role_change<F>(&self, listener: F) -> ActorFuture<()>
    where
        F: Fn(&RoleChange) + Send + 'static,
    {
        self.control
            .call(move |actor, _| actor.role_listeners.push(Box::new(listener)))
    }

    pub fn on_snapshot_installed<F>(&self, listener: F) -> ActorFuture<()>
    where
        F: Fn(&Snapshot) + Send + 'static,
    {
        self.control
            .call(move |actor, _| actor.snapshot_listeners.push(Box::new(listener)))
    }

    pub fn close(&self) -> ActorFuture<()> {
        self.control.close()
    }
}
