//! Shared fixtures for the integration tests.
//!
//! `Cluster` drives `RaftNode` cores deterministically: time advances only
//! through `tick`, messages move only through `deliver`. `MemoryLog` is an
//! in-memory `LogStream` that commits on append, for stream processor tests.

#![allow(dead_code)]

use bytes::Bytes;
use raftstream::actor::{ActorFuture, FutureError};
use raftstream::config::{LogConfig, RaftConfig};
use raftstream::engine::{Record, RecordBatch};
use raftstream::log::{FaultyFlusher, FlushFaults, LogEntry, MetaStore, RaftLog};
use raftstream::metrics::PartitionMetrics;
use raftstream::processor::LogStream;
use raftstream::raft::{Envelope, RaftNode, RaftNodeConfig, Role, RoleChange};
use raftstream::snapshot::{Snapshot, SnapshotId, SnapshotStore};
use slog::{o, Drain, Logger};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn create_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

pub struct TestNode {
    pub node: RaftNode,
    pub faults: FlushFaults,
    pub metrics: Arc<PartitionMetrics>,
    pub committed: Vec<LogEntry>,
    pub role_changes: Vec<RoleChange>,
    pub installed: Vec<Snapshot>,
}

pub struct Cluster {
    dir: TempDir,
    members: Vec<u64>,
    raft: RaftConfig,
    log: LogConfig,
    nodes: BTreeMap<u64, TestNode>,
    isolated: HashSet<u64>,
    in_flight: VecDeque<Envelope>,
    logger: Logger,
}

impl Cluster {
    pub fn new(members: &[u64]) -> Self {
        Self::with_config(members, RaftConfig::default(), LogConfig::default())
    }

    pub fn with_config(members: &[u64], raft: RaftConfig, log: LogConfig) -> Self {
        let mut cluster = Self {
            dir: TempDir::new().expect("temp dir"),
            members: members.to_vec(),
            raft,
            log,
            nodes: BTreeMap::new(),
            isolated: HashSet::new(),
            in_flight: VecDeque::new(),
            logger: create_logger(),
        };
        for id in members {
            let faults = FlushFaults::new();
            let node = cluster.open_node(*id, faults);
            cluster.nodes.insert(*id, node);
        }
        cluster
    }

    fn node_dir(&self, id: u64) -> PathBuf {
        self.dir.path().join(format!("node-{}", id))
    }

    fn open_node(&self, id: u64, faults: FlushFaults) -> TestNode {
        let logger = self.logger.new(o!("node" => id));
        let dir = self.node_dir(id);
        let log = RaftLog::open(
            dir.join("log"),
            &self.log,
            Arc::new(FaultyFlusher::new(faults.clone())),
            logger.clone(),
        )
        .expect("open log");
        let meta = MetaStore::open(dir.join("meta")).expect("open meta");
        let snapshots = SnapshotStore::open(dir.join("snapshots"), logger.clone()).expect("open snapshots");

        // Earlier members rank higher, like BrokerConfig::priority_of
        let count = self.members.len() as u32;
        let position = self.members.iter().position(|m| *m == id).unwrap_or(0) as u32;
        let config = RaftNodeConfig::new(id, 1, self.members.clone())
            .with_priority(count - position, count)
            .with_seed(id * 7919)
            .with_raft(self.raft.clone());
        let metrics = Arc::new(PartitionMetrics::new(1));
        TestNode {
            node: RaftNode::new(config, log, meta, snapshots, logger, metrics.clone()),
            faults,
            metrics,
            committed: Vec::new(),
            role_changes: Vec::new(),
            installed: Vec::new(),
        }
    }

    pub fn node(&self, id: u64) -> &RaftNode {
        &self.nodes[&id].node
    }

    pub fn test_node(&self, id: u64) -> &TestNode {
        &self.nodes[&id]
    }

    pub fn faults(&self, id: u64) -> &FlushFaults {
        &self.nodes[&id].faults
    }

    pub fn members(&self) -> &[u64] {
        &self.members
    }

    /// Drop a node and open it again from its directory
    pub fn restart(&mut self, id: u64) {
        let faults = match self.nodes.remove(&id) {
            Some(old) => old.faults,
            None => FlushFaults::new(),
        };
        self.in_flight.retain(|e| e.to != id && e.from != id);
        let node = self.open_node(id, faults);
        self.nodes.insert(id, node);
    }

    pub fn isolate(&mut self, id: u64) {
        self.isolated.insert(id);
    }

    pub fn reconnect(&mut self, id: u64) {
        self.isolated.remove(&id);
    }

    fn collect_ready(&mut self) {
        for test_node in self.nodes.values_mut() {
            let ready = test_node.node.take_ready();
            test_node.committed.extend(ready.committed);
            test_node.role_changes.extend(ready.role_changes);
            if let Some(snapshot) = ready.installed_snapshot {
                test_node.installed.push(snapshot);
            }
            self.in_flight.extend(ready.messages);
        }
    }

    /// Deliver messages until none are left
    pub fn deliver(&mut self) {
        for _ in 0..100_000 {
            self.collect_ready();
            let Some(envelope) = self.in_flight.pop_front() else {
                return;
            };
            if self.isolated.contains(&envelope.from) || self.isolated.contains(&envelope.to) {
                continue;
            }
            if let Some(target) = self.nodes.get_mut(&envelope.to) {
                target.node.step(envelope);
            }
        }
        panic!("messages kept flowing without settling");
    }

    /// Hand-craft a message, as if `envelope.from` had sent it, and settle
    pub fn send(&mut self, envelope: Envelope) {
        self.in_flight.push_back(envelope);
        self.deliver();
    }

    pub fn tick(&mut self, ticks: usize) {
        for _ in 0..ticks {
            for test_node in self.nodes.values_mut() {
                test_node.node.tick();
            }
            self.deliver();
        }
    }

    /// The connected leader with the highest term
    pub fn leader(&self) -> Option<u64> {
        self.nodes
            .iter()
            .filter(|(id, n)| n.node.role() == Role::Leader && !self.isolated.contains(id))
            .max_by_key(|(_, n)| n.node.term())
            .map(|(id, _)| *id)
    }

    pub fn wait_for_leader(&mut self, max_ticks: usize) -> u64 {
        for _ in 0..max_ticks {
            if let Some(leader) = self.leader() {
                return leader;
            }
            self.tick(1);
        }
        panic!("no leader elected within {} ticks", max_ticks);
    }

    /// Make `id` campaign right away and settle the election
    pub fn elect(&mut self, id: u64) {
        self.nodes
            .get_mut(&id)
            .expect("unknown node")
            .node
            .campaign();
        self.deliver();
        assert_eq!(self.leader(), Some(id), "node {} should have won the election", id);
    }

    pub fn propose(&mut self, id: u64, data: &[u8]) -> ActorFuture<u64> {
        let future = self
            .nodes
            .get_mut(&id)
            .expect("unknown node")
            .node
            .propose(Bytes::copy_from_slice(data));
        self.deliver();
        future
    }

    pub fn take_snapshot(&mut self, id: u64, index: u64, data: &[u8]) -> Option<SnapshotId> {
        self.nodes
            .get_mut(&id)
            .expect("unknown node")
            .node
            .take_snapshot(index, Bytes::copy_from_slice(data))
            .expect("take snapshot")
    }

    /// Index and term of every retained entry
    pub fn log_of(&self, id: u64) -> Vec<(u64, u64)> {
        let log = self.node(id).log();
        log.entries(log.first_index(), usize::MAX)
            .into_iter()
            .map(|e| (e.index, e.term))
            .collect()
    }

    /// Every pair of replicas agrees on all entries up to any index where
    /// their terms match
    pub fn assert_log_matching(&self) {
        for a in &self.members {
            for b in &self.members {
                if a >= b {
                    continue;
                }
                let (log_a, log_b) = (self.node(*a).log(), self.node(*b).log());
                let first = log_a.first_index().max(log_b.first_index());
                let last = log_a.last_index().min(log_b.last_index());
                let mut matched_at = None;
                for index in (first..=last).rev() {
                    if log_a.term_at(index).is_some() && log_a.term_at(index) == log_b.term_at(index) {
                        matched_at = Some(index);
                        break;
                    }
                }
                let Some(matched_at) = matched_at else {
                    continue;
                };
                for index in first..=matched_at {
                    assert_eq!(
                        log_a.entry(index),
                        log_b.entry(index),
                        "nodes {} and {} differ at index {} below matching index {}",
                        a,
                        b,
                        index,
                        matched_at
                    );
                }
            }
        }
    }

    pub fn assert_converged(&self) {
        let reference = self.log_of(self.members[0]);
        for id in &self.members[1..] {
            let log = self.log_of(*id);
            let last_reference = reference.last().copied();
            assert_eq!(log.last().copied(), last_reference, "node {} ends elsewhere", id);
        }
        self.assert_log_matching();
    }
}

/// In-memory log that commits every append immediately
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
    listeners: Mutex<Vec<Box<dyn Fn(u64) + Send>>>,
    failing: Mutex<bool>,
    snapshots: Mutex<Vec<SnapshotId>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_commit<F: Fn(u64) + Send + 'static>(&self, listener: F) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn push(&self, payload: Option<Bytes>) -> u64 {
        let index = {
            let mut entries = self.entries.lock().unwrap();
            let index = entries.len() as u64 + 1;
            let entry = match payload {
                Some(data) => LogEntry::application(index, 1, 0, data),
                None => LogEntry::initial(index, 1, 0),
            };
            entries.push(entry);
            index
        };
        for listener in self.listeners.lock().unwrap().iter() {
            listener(index);
        }
        index
    }

    /// Append a leader's initial entry, returning its index
    pub fn append_initial(&self) -> u64 {
        self.push(None)
    }

    pub fn append_records(&self, records: Vec<Record>) -> u64 {
        let data = RecordBatch::new(records).encode().expect("encode records");
        self.push(Some(data))
    }

    pub fn last_index(&self) -> u64 {
        self.entries.lock().unwrap().len() as u64
    }

    pub fn records(&self) -> Vec<Record> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .flat_map(|entry| RecordBatch::decode(entry).expect("decode records"))
            .collect()
    }

    pub fn snapshots(&self) -> Vec<SnapshotId> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl LogStream for MemoryLog {
    fn read_committed(&self, from: u64, max: usize) -> ActorFuture<Vec<LogEntry>> {
        let entries = self.entries.lock().unwrap();
        let start = (from.max(1) - 1) as usize;
        let slice = entries.iter().skip(start).take(max).cloned().collect();
        ActorFuture::completed(slice)
    }

    fn append(&self, data: Bytes) -> ActorFuture<u64> {
        if *self.failing.lock().unwrap() {
            return ActorFuture::failed(FutureError::message("append rejected"));
        }
        ActorFuture::completed(self.push(Some(data)))
    }

    fn take_snapshot(&self, index: u64, data: Bytes) -> ActorFuture<Option<SnapshotId>> {
        let id = Snapshot::new(index, 1, data).id;
        self.snapshots.lock().unwrap().push(id.clone());
        ActorFuture::completed(Some(id))
    }
}
