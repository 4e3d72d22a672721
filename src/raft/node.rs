//! Raft Node (Layer 3)
//!
//! Deterministic consensus core of one partition replica. It owns the log,
//! the term/vote metadata and the snapshot store, and is driven entirely from
//! outside: `tick` advances logical time, `step` feeds an inbound message and
//! `propose` appends a new entry. Everything the node wants to happen outside
//! of itself (messages to send, newly committed entries, role changes) is
//! collected into a `Ready` taken with `take_ready`.
//!
//! Commit requires a strict majority of members to have *flushed* an entry:
//! the leader counts its own flushed index, followers acknowledge only after
//! a successful flush.

use super::message::{Envelope, RaftMessage};
use crate::actor::{ActorFuture, FutureError};
use crate::config::RaftConfig;
use crate::log::{EntryPayload, LogEntry, LogError, MetaStore, RaftLog, RaftMeta};
use crate::metrics::{self, PartitionMetrics};
use crate::retry::Recoverable;
use crate::snapshot::{Snapshot, SnapshotAssembler, SnapshotError, SnapshotId, SnapshotStore};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Configuration for RaftNode initialization
#[derive(Clone, Debug)]
pub struct RaftNodeConfig {
    pub node_id: u64,
    pub partition: u32,

    /// All members of the partition, including this node
    pub members: Vec<u64>,

    /// Election priority of this node; higher campaigns sooner
    pub priority: u32,

    /// Highest priority of any member
    pub max_priority: u32,

    /// Seed of the election timeout jitter
    pub seed: u64,

    pub raft: RaftConfig,
}

impl RaftNodeConfig {
    pub fn new(node_id: u64, partition: u32, members: Vec<u64>) -> Self {
        Self {
            node_id,
            partition,
            members,
            priority: 1,
            max_priority: 1,
            seed: node_id,
            raft: RaftConfig::default(),
        }
    }

    pub fn with_priority(mut self, priority: u32, max_priority: u32) -> Self {
        self.priority = priority;
        self.max_priority = max_priority.max(priority);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    /// Detected a safety violation; waits for a snapshot install
    Inactive,
}

impl Role {
    fn gauge(self) -> u64 {
        match self {
            Role::Inactive => metrics::ROLE_INACTIVE,
            Role::Follower => metrics::ROLE_FOLLOWER,
            Role::Candidate => metrics::ROLE_CANDIDATE,
            Role::Leader => metrics::ROLE_LEADER,
        }
    }
}

/// Role change notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleChange {
    BecameFollower { term: u64 },
    BecameCandidate { term: u64 },
    /// `ready_index` is the leader's initial entry; once it commits, every
    /// earlier entry is committed too
    BecameLeader { term: u64, ready_index: u64 },
    BecameInactive { term: u64 },
}

/// Why a proposal did not commit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("failed to flush appended entry {index}: {reason}")]
    FlushFailed { index: u64, reason: String },

    #[error("failed to append entry locally: {reason}")]
    AppendFailed { reason: String },

    #[error("leadership lost in term {term} before the entry committed")]
    LeadershipLost { term: u64 },
}

impl Recoverable for AppendError {
    fn is_recoverable(&self) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("failed to persist raft metadata: {0}")]
    Meta(#[from] std::io::Error),

    #[error("index {index} is not committed (commit index {commit_index})")]
    NotCommitted { index: u64, commit_index: u64 },

    #[error("no term known for index {index}")]
    UnknownTerm { index: u64 },
}

impl Recoverable for RaftError {
    fn is_recoverable(&self) -> bool {
        match self {
            RaftError::Log(e) => e.is_recoverable(),
            RaftError::Snapshot(SnapshotError::Io(_)) | RaftError::Meta(_) => true,
            _ => false,
        }
    }
}

/// Output of the node since the last `take_ready`
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Envelope>,
    pub committed: Vec<LogEntry>,
    pub role_changes: Vec<RoleChange>,
    pub installed_snapshot: Option<Snapshot>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.committed.is_empty()
            && self.role_changes.is_empty()
            && self.installed_snapshot.is_none()
    }
}

/// Leader's view of one follower
#[derive(Debug, Clone)]
struct Progress {
    next_index: u64,
    match_index: u64,
    install: Option<InstallProgress>,
}

#[derive(Debug, Clone)]
struct InstallProgress {
    index: u64,
    offset: u64,
    /// The chunk carrying `done` is in flight
    done_sent: bool,
}

pub struct RaftNode {
    id: u64,
    partition: u32,
    members: Vec<u64>,
    config: RaftConfig,
    priority: u32,
    max_priority: u32,

    log: RaftLog,
    meta: MetaStore,
    snapshots: SnapshotStore,

    term: u64,
    voted_for: Option<u64>,
    role: Role,
    leader: Option<u64>,

    election_elapsed: u64,
    heartbeat_elapsed: u64,
    election_timeout: u64,
    rng: StdRng,

    votes: HashSet<u64>,
    progress: HashMap<u64, Progress>,
    /// Peers that answered since the last quorum check
    recent_active: HashSet<u64>,
    pending: BTreeMap<u64, ActorFuture<u64>>,

    commit_index: u64,
    /// Highest index already handed out in `Ready::committed`
    emitted_index: u64,
    assembler: Option<SnapshotAssembler>,

    ready: Ready,
    logger: Logger,
    metrics: Arc<PartitionMetrics>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RaftNode {
    pub fn new(
        config: RaftNodeConfig,
        mut log: RaftLog,
        meta: MetaStore,
        snapshots: SnapshotStore,
        logger: Logger,
        metrics: Arc<PartitionMetrics>,
    ) -> Self {
        let RaftMeta {
            term,
            voted_for,
            inactive,
        } = meta.get();

        let mut commit_index = log.base_index();
        if let Some(snapshot) = snapshots.latest() {
            commit_index = commit_index.max(snapshot.id.index);
        }
        log.set_commit_index(commit_index);

        let mut node = Self {
            id: config.node_id,
            partition: config.partition,
            members: config.members,
            config: config.raft,
            priority: config.priority,
            max_priority: config.max_priority,
            log,
            meta,
            snapshots,
            term,
            voted_for,
            role: if inactive { Role::Inactive } else { Role::Follower },
            leader: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_timeout: 0,
            rng: StdRng::seed_from_u64(config.seed),
            votes: HashSet::new(),
            progress: HashMap::new(),
            recent_active: HashSet::new(),
            pending: BTreeMap::new(),
            commit_index,
            emitted_index: commit_index,
            assembler: None,
            ready: Ready::default(),
            logger,
            metrics,
        };
        node.reset_election_timeout();
        node.metrics.set_role(node.role.gauge());
        if inactive {
            warn!(node.logger, "Replica stays inactive until a snapshot is installed"; "term" => term);
        }

        info!(node.logger, "Raft node started";
            "term" => node.term, "first_index" => node.log.first_index(),
            "last_index" => node.log.last_index(), "commit_index" => node.commit_index,
            "election_timeout" => node.election_timeout);
        node
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader(&self) -> Option<u64> {
        self.leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RaftLog {
        &mut self.log
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.latest()
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.log.term_at(index)
    }

    /// Committed entries starting at `from`, at most `max`
    pub fn read_committed(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from > self.commit_index {
            return Vec::new();
        }
        let available = (self.commit_index - from + 1) as usize;
        self.log.entries(from, max.min(available))
    }

    pub fn take_ready(&mut self) -> Ready {
        std::mem::take(&mut self.ready)
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn peers(&self) -> Vec<u64> {
        self.members.iter().copied().filter(|id| *id != self.id).collect()
    }

    fn reset_election_timeout(&mut self) {
        let tick = self.config.election_tick.max(1);
        let priority_delay =
            u64::from(self.max_priority.saturating_sub(self.priority)) * self.config.heartbeat_tick;
        self.election_elapsed = 0;
        self.election_timeout = tick + self.rng.gen_range(0..tick) + priority_delay;
    }

    fn send(&mut self, to: u64, message: RaftMessage) {
        self.ready.messages.push(Envelope {
            partition: self.partition,
            from: self.id,
            to,
            message,
        });
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
        self.metrics.set_role(role.gauge());
        let change = match role {
            Role::Follower => RoleChange::BecameFollower { term: self.term },
            Role::Candidate => RoleChange::BecameCandidate { term: self.term },
            Role::Inactive => RoleChange::BecameInactive { term: self.term },
            // Leaders announce themselves once their initial entry is appended
            Role::Leader => return,
        };
        self.ready.role_changes.push(change);
    }

    fn persist_meta(&mut self) -> bool {
        let meta = RaftMeta {
            term: self.term,
            voted_for: self.voted_for,
            inactive: self.role == Role::Inactive,
        };
        match self.meta.store(meta) {
            Ok(()) => true,
            Err(e) => {
                error!(self.logger, "Failed to persist term and vote"; "term" => self.term, "error" => %e);
                false
            }
        }
    }

    fn fail_pending(&mut self, error: AppendError) {
        if self.pending.is_empty() {
            return;
        }
        debug!(self.logger, "Failing pending proposals"; "count" => self.pending.len(), "reason" => %error);
        for (_, future) in std::mem::take(&mut self.pending) {
            future.fail(FutureError::failed(error.clone()));
        }
    }

    /// Adopt `term` (if higher) and follow `leader`
    fn become_follower(&mut self, term: u64, leader: Option<u64>) {
        let was_leader = self.role == Role::Leader;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_meta();
        }
        if was_leader {
            self.fail_pending(AppendError::LeadershipLost { term: self.term });
        }
        self.leader = leader;
        self.progress.clear();
        self.votes.clear();
        if self.role != Role::Follower && self.role != Role::Inactive {
            info!(self.logger, "Became follower"; "term" => self.term, "leader" => ?leader);
            self.set_role(Role::Follower);
        }
        self.reset_election_timeout();
    }

    /// Leave leadership in the current term after a local storage failure
    fn step_down(&mut self, error: AppendError) {
        warn!(self.logger, "Leader stepping down"; "term" => self.term, "reason" => %error);
        self.fail_pending(error);
        self.leader = None;
        self.progress.clear();
        self.set_role(Role::Follower);
        self.reset_election_timeout();
    }

    fn become_inactive(&mut self, reason: &str) {
        error!(self.logger, "Consensus safety violation, replica inactive until resynchronized";
            "reason" => reason, "term" => self.term, "commit_index" => self.commit_index);
        self.fail_pending(AppendError::LeadershipLost { term: self.term });
        self.leader = None;
        self.progress.clear();
        self.set_role(Role::Inactive);
        self.persist_meta();
    }

    /// Advance logical time by one tick
    pub fn tick(&mut self) {
        match self.role {
            Role::Inactive => {}
            Role::Leader => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.config.election_tick {
                    self.election_elapsed = 0;
                    if !self.check_quorum() {
                        return;
                    }
                }
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    self.on_election_timeout();
                }
            }
        }
    }

    /// A leader that has not heard from a quorum for an election period steps down
    fn check_quorum(&mut self) -> bool {
        let active = self.recent_active.len() + 1;
        self.recent_active.clear();
        if active >= self.quorum() {
            return true;
        }
        info!(self.logger, "Lost contact with quorum"; "active" => active, "quorum" => self.quorum());
        self.fail_pending(AppendError::LeadershipLost { term: self.term });
        self.leader = None;
        self.progress.clear();
        self.set_role(Role::Follower);
        self.reset_election_timeout();
        false
    }

    fn on_election_timeout(&mut self) {
        // An unflushed tail could win an election the replica cannot serve
        if self.log.flushed_index() < self.log.last_index() {
            if let Err(e) = self.log.flush() {
                self.metrics.record_flush_failure();
                warn!(self.logger, "Not campaigning while the log cannot be flushed"; "error" => %e);
                self.reset_election_timeout();
                return;
            }
        }
        self.campaign();
    }

    /// Start an election for the next term
    pub fn campaign(&mut self) {
        if self.role == Role::Leader || self.role == Role::Inactive {
            return;
        }

        self.term += 1;
        self.voted_for = Some(self.id);
        if !self.persist_meta() {
            self.reset_election_timeout();
            return;
        }

        info!(self.logger, "Starting election"; "term" => self.term,
            "last_index" => self.log.last_index(), "last_term" => self.log.last_term());
        self.metrics.record_election();
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.set_role(Role::Candidate);
        self.reset_election_timeout();

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let request = RaftMessage::VoteRequest {
            term: self.term,
            candidate: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers() {
            self.send(peer, request.clone());
        }
    }

    fn become_leader(&mut self) {
        info!(self.logger, "Became leader"; "term" => self.term, "last_index" => self.log.last_index());
        self.set_role(Role::Leader);
        self.leader = Some(self.id);
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;
        self.recent_active.clear();
        self.votes.clear();

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers()
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index,
                        match_index: 0,
                        install: None,
                    },
                )
            })
            .collect();

        let ready_index = match self.append_local(EntryPayload::Initial) {
            Ok(index) => index,
            Err(error) => {
                self.step_down(error);
                return;
            }
        };
        self.ready.role_changes.push(RoleChange::BecameLeader {
            term: self.term,
            ready_index,
        });

        if let Err(error) = self.flush_leader() {
            self.step_down(error);
            return;
        }
        self.broadcast_append();
        self.maybe_commit();
    }

    /// Append at the leader, retrying a bounded number of times
    fn append_local(&mut self, payload: EntryPayload) -> Result<u64, AppendError> {
        let attempts = self.config.max_append_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let entry = LogEntry {
                index: self.log.last_index() + 1,
                term: self.term,
                timestamp: now_millis(),
                payload: payload.clone(),
            };
            match self.log.append(entry) {
                Ok(index) => {
                    self.metrics.record_appended(1);
                    return Ok(index);
                }
                Err(e) => {
                    warn!(self.logger, "Local append failed"; "attempt" => attempt, "error" => %e);
                    last_error = e.to_string();
                }
            }
        }
        Err(AppendError::AppendFailed { reason: last_error })
    }

    fn flush_leader(&mut self) -> Result<(), AppendError> {
        self.log.flush().map(|_| ()).map_err(|e| {
            self.metrics.record_flush_failure();
            AppendError::FlushFailed {
                index: e.index,
                reason: e.reason,
            }
        })
    }

    /// Append `data` as a new entry. Resolves with its index once committed.
    pub fn propose(&mut self, data: Bytes) -> ActorFuture<u64> {
        if self.role != Role::Leader {
            return ActorFuture::failed(FutureError::failed(AppendError::NotLeader {
                leader: self.leader,
            }));
        }

        let index = match self.append_local(EntryPayload::Application(data)) {
            Ok(index) => index,
            Err(error) => {
                let failed = ActorFuture::failed(FutureError::failed(error.clone()));
                self.step_down(error);
                return failed;
            }
        };

        let future = ActorFuture::new();
        self.pending.insert(index, future.clone());

        if let Err(error) = self.flush_leader() {
            self.step_down(error);
            return future;
        }

        self.broadcast_append();
        self.maybe_commit();
        future
    }

    fn broadcast_append(&mut self) {
        for peer in self.peers() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: u64) {
        let Some(progress) = self.progress.get(&peer).cloned() else {
            return;
        };

        if progress.install.is_some() || progress.next_index < self.log.first_index() {
            self.send_install_chunk(peer);
            return;
        }

        let prev_index = progress.next_index - 1;
        let Some(prev_term) = self.log.term_at(prev_index) else {
            self.send_install_chunk(peer);
            return;
        };
        let entries = self.log.entries(progress.next_index, self.config.max_append_batch);
        let message = RaftMessage::AppendRequest {
            term: self.term,
            leader: self.id,
            prev_index,
            prev_term,
            entries,
            commit_index: self.commit_index,
        };
        self.send(peer, message);
    }

    fn send_install_chunk(&mut self, peer: u64) {
        let Some(snapshot) = self.snapshots.latest().cloned() else {
            warn!(self.logger, "Follower needs a snapshot but none exists"; "peer" => peer);
            return;
        };
        let Some(progress) = self.progress.get_mut(&peer) else {
            return;
        };

        let install = progress.install.get_or_insert(InstallProgress {
            index: snapshot.id.index,
            offset: 0,
            done_sent: false,
        });
        if install.index != snapshot.id.index {
            *install = InstallProgress {
                index: snapshot.id.index,
                offset: 0,
                done_sent: false,
            };
        }

        let total = snapshot.data.len() as u64;
        let start = install.offset.min(total);
        let end = (start + self.config.snapshot_chunk_size as u64).min(total);
        let done = end >= total;
        install.done_sent = done;

        debug!(self.logger, "Sending snapshot chunk";
            "peer" => peer, "index" => snapshot.id.index, "offset" => start, "done" => done);
        let message = RaftMessage::InstallRequest {
            term: self.term,
            leader: self.id,
            index: snapshot.id.index,
            snapshot_term: snapshot.id.term,
            offset: start,
            data: snapshot.data.slice(start as usize..end as usize),
            done,
            checksum: snapshot.id.checksum.clone(),
        };
        self.send(peer, message);
    }

    /// Commit the highest index flushed by a quorum, if it is from this term
    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = self.progress.values().map(|p| p.match_index).collect();
        matched.push(self.log.flushed_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum() - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.term) {
            self.advance_commit(candidate);
            // Followers learn the new commit index right away
            self.broadcast_append();
        }
    }

    fn advance_commit(&mut self, index: u64) {
        let index = index.min(self.log.last_index());
        if index <= self.commit_index {
            return;
        }
        self.commit_index = index;
        self.log.set_commit_index(index);

        let from = self.emitted_index.max(self.log.base_index()) + 1;
        let committed = self.log.entries_between(from, index);
        self.metrics.record_committed(committed.len() as u64, index);
        self.emitted_index = index;
        self.ready.committed.extend(committed);

        let still_pending = self.pending.split_off(&(index + 1));
        for (entry_index, future) in std::mem::replace(&mut self.pending, still_pending) {
            future.complete(entry_index);
        }
    }

    /// Feed an inbound message
    pub fn step(&mut self, envelope: Envelope) {
        if envelope.to != self.id || envelope.partition != self.partition {
            warn!(self.logger, "Dropping misaddressed message";
                "to" => envelope.to, "partition" => envelope.partition);
            return;
        }
        let from = envelope.from;
        match envelope.message {
            RaftMessage::VoteRequest {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(from, term, candidate, last_log_index, last_log_term),
            RaftMessage::VoteResponse { term, granted } => {
                self.handle_vote_response(from, term, granted)
            }
            RaftMessage::AppendRequest {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                commit_index,
            } => self.handle_append(from, term, leader, prev_index, prev_term, entries, commit_index),
            RaftMessage::AppendResponse {
                term,
                succeeded,
                last_log_index,
                needs_snapshot,
            } => self.handle_append_response(from, term, succeeded, last_log_index, needs_snapshot),
            RaftMessage::InstallRequest {
                term,
                leader,
                index,
                snapshot_term,
                offset,
                data,
                done,
                checksum,
            } => self.handle_install(from, term, leader, index, snapshot_term, offset, data, done, checksum),
            RaftMessage::InstallResponse {
                term,
                succeeded,
                next_offset,
            } => self.handle_install_response(from, term, succeeded, next_offset),
        }
    }

    fn handle_vote_request(
        &mut self,
        from: u64,
        term: u64,
        candidate: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        if term > self.term && self.role != Role::Inactive {
            self.become_follower(term, None);
        }

        let up_to_date = (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index());
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(candidate);
        let mut granted = term == self.term && self.role == Role::Follower && can_vote && up_to_date;
        if granted {
            self.voted_for = Some(candidate);
            granted = self.persist_meta();
        }
        if granted {
            self.reset_election_timeout();
        }
        debug!(self.logger, "Vote requested";
            "candidate" => candidate, "term" => term, "granted" => granted, "up_to_date" => up_to_date);
        self.send(
            from,
            RaftMessage::VoteResponse {
                term: self.term,
                granted,
            },
        );
    }

    fn handle_vote_response(&mut self, from: u64, term: u64, granted: bool) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role != Role::Candidate || term != self.term || !granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append(
        &mut self,
        from: u64,
        term: u64,
        leader: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        if term < self.term {
            self.respond_append(from, false, self.log.last_index(), false);
            return;
        }
        if self.role == Role::Inactive {
            if term > self.term {
                self.term = term;
                self.voted_for = None;
                self.persist_meta();
            }
            self.leader = Some(leader);
            self.respond_append(from, false, self.log.last_index(), true);
            return;
        }
        if term > self.term || self.role != Role::Follower {
            self.become_follower(term, Some(leader));
        }
        self.leader = Some(leader);
        self.election_elapsed = 0;

        // Entries at or below the compaction point are committed and identical everywhere
        if prev_index > self.log.base_index() {
            if prev_index > self.log.last_index() {
                self.respond_append(from, false, self.log.last_index(), false);
                return;
            }
            if self.log.term_at(prev_index) != Some(prev_term) {
                if prev_index <= self.commit_index {
                    self.become_inactive("committed entry conflicts with the leader's log");
                    return;
                }
                let hint = prev_index.saturating_sub(1).min(self.log.last_index());
                self.respond_append(from, false, hint, false);
                return;
            }
        }

        let last_new = prev_index + entries.len() as u64;
        for entry in entries {
            if entry.index <= self.log.base_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        self.become_inactive("leader overwrites a committed entry");
                        return;
                    }
                    if let Err(e) = self.log.truncate(entry.index) {
                        warn!(self.logger, "Failed to truncate conflicting suffix"; "error" => %e);
                        if matches!(e, LogError::TruncateCommitted { .. }) {
                            self.become_inactive("truncation would remove committed entries");
                            return;
                        }
                        self.respond_append(from, false, prev_index, false);
                        return;
                    }
                }
                None => {}
            }
            if let Err(e) = self.log.append(entry) {
                warn!(self.logger, "Failed to append replicated entry"; "error" => %e);
                self.respond_append(from, false, self.log.last_index().min(prev_index), false);
                return;
            }
            self.metrics.record_appended(1);
        }

        let commit = leader_commit.min(last_new);
        if commit > self.commit_index {
            self.advance_commit(commit);
        }

        if self.log.flushed_index() < self.log.last_index() {
            if let Err(e) = self.log.flush() {
                self.metrics.record_flush_failure();
                warn!(self.logger, "Failed to flush appended entries, leader will retry";
                    "prev_index" => prev_index, "error" => %e);
                self.respond_append(from, false, prev_index, false);
                return;
            }
        }
        self.respond_append(from, true, last_new, false);
    }

    fn respond_append(&mut self, to: u64, succeeded: bool, last_log_index: u64, needs_snapshot: bool) {
        self.send(
            to,
            RaftMessage::AppendResponse {
                term: self.term,
                succeeded,
                last_log_index,
                needs_snapshot,
            },
        );
    }

    fn handle_append_response(
        &mut self,
        from: u64,
        term: u64,
        succeeded: bool,
        last_log_index: u64,
        needs_snapshot: bool,
    ) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role != Role::Leader || term < self.term {
            return;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };

        self.recent_active.insert(from);

        if needs_snapshot {
            if progress.install.is_none() {
                progress.install = Some(InstallProgress {
                    index: 0,
                    offset: 0,
                    done_sent: false,
                });
                self.send_install_chunk(from);
            }
            return;
        }

        if succeeded {
            if last_log_index > progress.match_index {
                progress.match_index = last_log_index;
            }
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let behind = progress.next_index <= last_index;
            self.maybe_commit();
            if behind {
                self.send_append(from);
            }
        } else if last_log_index + 1 < progress.next_index {
            progress.next_index = (last_log_index + 1).max(progress.match_index + 1).max(1);
            self.send_append(from);
        }
        // Otherwise (failed flush on the follower) the next heartbeat resends
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_install(
        &mut self,
        from: u64,
        term: u64,
        leader: u64,
        index: u64,
        snapshot_term: u64,
        offset: u64,
        data: Bytes,
        done: bool,
        checksum: String,
    ) {
        if term < self.term {
            self.respond_install(from, false, 0);
            return;
        }
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_meta();
        }
        if self.role != Role::Follower && self.role != Role::Inactive {
            self.become_follower(term, Some(leader));
        }
        self.leader = Some(leader);
        self.election_elapsed = 0;

        if index <= self.commit_index && self.role != Role::Inactive {
            // Already covered, skip ahead
            self.assembler = None;
            self.respond_install(from, true, offset + data.len() as u64);
            return;
        }

        if offset == 0 {
            info!(self.logger, "Receiving snapshot"; "index" => index, "term" => snapshot_term, "leader" => leader);
            self.assembler = Some(SnapshotAssembler::new(index, snapshot_term));
        }
        let Some(assembler) = self.assembler.as_mut().filter(|a| a.index == index) else {
            self.respond_install(from, false, 0);
            return;
        };
        if let Err(e) = assembler.push(offset, &data) {
            warn!(self.logger, "Rejected snapshot chunk"; "error" => %e);
            let next_offset = assembler.next_offset();
            self.respond_install(from, false, next_offset);
            return;
        }
        let next_offset = assembler.next_offset();
        if !done {
            self.respond_install(from, true, next_offset);
            return;
        }

        let Some(assembler) = self.assembler.take() else {
            return;
        };
        match self.install_snapshot(assembler, &checksum) {
            Ok(()) => self.respond_install(from, true, next_offset),
            Err(e) => {
                warn!(self.logger, "Failed to install snapshot"; "index" => index, "error" => %e);
                self.respond_install(from, false, 0);
            }
        }
    }

    fn install_snapshot(&mut self, assembler: SnapshotAssembler, checksum: &str) -> Result<(), RaftError> {
        let snapshot = assembler.finish(checksum)?;
        let index = snapshot.id.index;
        let term = snapshot.id.term;

        self.snapshots.persist(snapshot.clone())?;
        self.log.reset(index + 1, term)?;
        self.commit_index = index;
        self.emitted_index = index;
        self.log.set_commit_index(index);
        self.metrics.record_committed(0, index);

        info!(self.logger, "Installed snapshot"; "index" => index, "term" => term);
        self.ready.installed_snapshot = Some(snapshot);
        if self.role == Role::Inactive {
            self.set_role(Role::Follower);
            self.reset_election_timeout();
            if !self.persist_meta() {
                // Still marked inactive on disk; a restart waits for another install
                warn!(self.logger, "Resynchronized replica could not clear its inactive mark"; "index" => index);
            }
        }
        Ok(())
    }

    fn respond_install(&mut self, to: u64, succeeded: bool, next_offset: u64) {
        self.send(
            to,
            RaftMessage::InstallResponse {
                term: self.term,
                succeeded,
                next_offset,
            },
        );
    }

    fn handle_install_response(&mut self, from: u64, term: u64, succeeded: bool, next_offset: u64) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role != Role::Leader || term < self.term {
            return;
        }
        self.recent_active.insert(from);
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };
        let Some(install) = progress.install.as_mut() else {
            return;
        };

        if !succeeded {
            install.offset = next_offset;
            install.done_sent = false;
            return;
        }
        if install.done_sent {
            let index = install.index;
            progress.install = None;
            progress.match_index = progress.match_index.max(index);
            progress.next_index = index + 1;
            info!(self.logger, "Follower installed snapshot"; "peer" => from, "index" => index);
            self.maybe_commit();
            self.send_append(from);
        } else {
            install.offset = next_offset;
            self.send_install_chunk(from);
        }
    }

    /// Persist a snapshot of state covering the log up to `index` and
    /// compact the log behind it
    pub fn take_snapshot(&mut self, index: u64, data: Bytes) -> Result<Option<SnapshotId>, RaftError> {
        if index > self.commit_index {
            return Err(RaftError::NotCommitted {
                index,
                commit_index: self.commit_index,
            });
        }
        let term = self
            .log
            .term_at(index)
            .ok_or(RaftError::UnknownTerm { index })?;
        let snapshot = Snapshot::new(index, term, data);
        let id = snapshot.id.clone();
        if !self.snapshots.persist(snapshot)? {
            return Ok(None);
        }
        self.metrics.record_snapshot();
        let removed = self.log.compact(index)?;
        debug!(self.logger, "Snapshot taken"; "index" => index, "segments_removed" => removed);
        Ok(Some(id))
    }
}
