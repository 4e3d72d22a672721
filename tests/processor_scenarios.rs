mod common;

use common::{create_logger, MemoryLog};
use raftstream::actor::{ActorFuture, ActorScheduler};
use raftstream::blacklist::Blacklist;
use raftstream::config::ProcessorConfig;
use raftstream::engine::{
    Command, CommandResponse, Engine, EngineError, Intent, ProcessInstance, Record, RejectionType,
};
use raftstream::metrics::PartitionMetrics;
use raftstream::processor::{
    ErrorPhase, Mode, ProcessingResult, RecordProcessor, ResponseRegistry, StreamProcessor,
    StreamProcessorHandle,
};
use raftstream::raft::RoleChange;
use raftstream::state::{StateDb, Transaction};
use slog::Logger;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Switches that make `FaultyEngine` fail on purpose
#[derive(Clone, Default)]
struct Faults {
    poisoned: Arc<Mutex<HashSet<u64>>>,
    broken_error_handling: Arc<AtomicBool>,
}

impl Faults {
    fn poison(&self, key: u64) {
        self.poisoned.lock().unwrap().insert(key);
    }

    fn heal(&self) {
        self.poisoned.lock().unwrap().clear();
        self.broken_error_handling.store(false, Ordering::SeqCst);
    }

    fn break_error_handling(&self) {
        self.broken_error_handling.store(true, Ordering::SeqCst);
    }
}

/// The workflow engine, except for instances whose state "is corrupt"
struct FaultyEngine {
    engine: Engine,
    faults: Faults,
}

impl RecordProcessor for FaultyEngine {
    fn process(&mut self, command: &Record, txn: &mut Transaction) -> Result<ProcessingResult, EngineError> {
        if let Some(key) = command.process_instance_key() {
            if self.faults.poisoned.lock().unwrap().contains(&key) {
                return Err(EngineError::Corrupted {
                    key,
                    reason: "poisoned by test".to_string(),
                });
            }
        }
        self.engine.process(command, txn)
    }

    fn replay(&mut self, event: &Record, txn: &mut Transaction) -> Result<(), EngineError> {
        self.engine.replay(event, txn)
    }

    fn on_processing_error(
        &mut self,
        command: &Record,
        error: &dyn std::error::Error,
        txn: &mut Transaction,
    ) -> Result<ProcessingResult, EngineError> {
        if self.faults.broken_error_handling.load(Ordering::SeqCst) {
            return Err(EngineError::Corrupted {
                key: command.process_instance_key().unwrap_or_default(),
                reason: "error handling broken by test".to_string(),
            });
        }
        self.engine.on_processing_error(command, error, txn)
    }
}

struct Harness {
    log: Arc<MemoryLog>,
    handle: StreamProcessorHandle<FaultyEngine>,
    responses: ResponseRegistry,
    metrics: Arc<PartitionMetrics>,
    faults: Faults,
}

impl Harness {
    fn start(
        state_dir: &Path,
        log: Arc<MemoryLog>,
        config: ProcessorConfig,
        scheduler: &ActorScheduler,
        logger: &Logger,
    ) -> Self {
        let state = open_state(state_dir, logger);
        let metrics = Arc::new(PartitionMetrics::new(1));
        let blacklist = Blacklist::new(metrics.clone(), logger.clone());
        let faults = Faults::default();
        let engine = FaultyEngine {
            engine: Engine::new(1, blacklist.clone(), Duration::from_secs(3600), logger.clone()),
            faults: faults.clone(),
        };
        let responses = ResponseRegistry::new(1);
        let processor = StreamProcessor::new(
            1,
            engine,
            state,
            log.clone(),
            blacklist,
            responses.clone(),
            metrics.clone(),
            config,
            0,
            logger.clone(),
        )
        .expect("create processor");
        let handle = StreamProcessorHandle::spawn(processor, scheduler);

        let listener = handle.clone();
        log.on_commit(move |index| listener.notify_commit(index));

        Self {
            log,
            handle,
            responses,
            metrics,
            faults,
        }
    }

    /// Write the leader's initial entry and switch the processor to processing
    async fn become_leader(&self, term: u64) {
        let ready_index = self.log.append_initial();
        self.handle
            .notify_role_change(RoleChange::BecameLeader { term, ready_index });
        let handle = &self.handle;
        wait_until(move || async move { handle.mode().await.ok() == Some(Mode::Processing) }).await;
    }

    fn submit_record(&self, command: Command) -> ActorFuture<CommandResponse> {
        let (request, response) = self.responses.register();
        let mut record = command.into_record();
        record.request = Some(request);
        record.timestamp = 1_000;
        self.log.append_records(vec![record]);
        response
    }

    async fn submit(&self, command: Command) -> CommandResponse {
        tokio::time::timeout(TIMEOUT, self.submit_record(command))
            .await
            .expect("response in time")
            .expect("response")
    }

    /// Append a command nobody waits for, like one written by the engine itself
    fn append_internal(&self, command: Command) -> u64 {
        let mut record = command.into_record();
        record.timestamp = 1_000;
        self.log.append_records(vec![record])
    }

    async fn instance(&self, key: u64) -> Option<ProcessInstance> {
        self.handle
            .query(move |state, _| Engine::instance(state, key).ok().flatten())
            .await
            .expect("query")
    }

    async fn instances(&self) -> Vec<ProcessInstance> {
        self.handle
            .query(|state, _| Engine::instances(state).unwrap_or_default())
            .await
            .expect("query")
    }

    async fn is_blacklisted(&self, key: u64) -> bool {
        self.handle
            .query(move |state, blacklist| blacklist.is_blacklisted(state, key).ok())
            .await
            .expect("query")
            .expect("read blacklist")
    }

    async fn last_processed(&self) -> u64 {
        self.handle.last_processed_position().await.expect("position")
    }

    async fn close(self) {
        self.handle.close().await.expect("close processor");
    }
}

fn open_state(dir: &Path, logger: &Logger) -> StateDb {
    StateDb::open(dir, logger.clone()).expect("open state")
}

fn config() -> ProcessorConfig {
    ProcessorConfig::default()
        .with_snapshot_period(0)
        .with_processing_retry_delay(Duration::from_millis(20))
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within {:?}", TIMEOUT);
}

fn deploy(tasks: &[&str]) -> Command {
    Command::Deploy {
        process_id: "order".to_string(),
        tasks: tasks.iter().map(|t| t.to_string()).collect(),
    }
}

fn create() -> Command {
    Command::CreateInstance {
        process_id: "order".to_string(),
        variables: serde_json::json!({ "amount": 3 }),
        tenant_id: None,
    }
}

fn complete(key: u64) -> Command {
    Command::CompleteTask {
        process_instance_key: key,
    }
}

fn state_dir(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_does_not_process_commands_twice() {
    let dir = TempDir::new().unwrap();
    let logger = create_logger();
    let scheduler = ActorScheduler::for_current_runtime(logger.clone());
    let log = MemoryLog::new();

    let leader = Harness::start(&state_dir(&dir, "state"), log.clone(), config(), &scheduler, &logger);
    leader.become_leader(1).await;
    assert!(leader.submit(deploy(&["pick", "pack"])).await.is_accepted());
    let key = leader.submit(create()).await.key().expect("instance key");
    assert!(leader.submit(complete(key)).await.is_accepted());

    let before = leader.instances().await;
    let position = leader.last_processed().await;
    leader.close().await;
    let entries = log.last_index();

    // Same log, same state directory: everything up to the position is done
    let restarted = Harness::start(&state_dir(&dir, "state"), log.clone(), config(), &scheduler, &logger);
    assert_eq!(restarted.last_processed().await, position);
    restarted.become_leader(2).await;
    assert_eq!(log.last_index(), entries + 1, "no follow-ups may be written again");
    assert_eq!(restarted.instances().await, before);
    assert_eq!(restarted.last_processed().await, position);

    // Processing continues where it stopped
    let response = restarted.submit(complete(key)).await;
    match response {
        CommandResponse::Accepted { intent, .. } => assert_eq!(intent, Intent::Completed),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(restarted.instance(key).await, None);
    restarted.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follower_replay_matches_leader_and_takes_over() {
    let dir = TempDir::new().unwrap();
    let logger = create_logger();
    let scheduler = ActorScheduler::for_current_runtime(logger.clone());
    let log = MemoryLog::new();

    let leader = Harness::start(&state_dir(&dir, "leader"), log.clone(), config(), &scheduler, &logger);
    let follower = Harness::start(&state_dir(&dir, "follower"), log.clone(), config(), &scheduler, &logger);
    leader.become_leader(1).await;

    assert!(leader.submit(deploy(&["pick", "pack"])).await.is_accepted());
    let mut keys = Vec::new();
    for _ in 0..3 {
        keys.push(leader.submit(create()).await.key().expect("instance key"));
    }
    assert!(leader.submit(complete(keys[0])).await.is_accepted());
    let rejected = leader.submit(complete(12_345)).await;
    assert!(matches!(
        rejected,
        CommandResponse::Rejected {
            rejection_type: RejectionType::NotFound,
            ..
        }
    ));

    let position = leader.last_processed().await;
    let replica = &follower;
    wait_until(move || async move { replica.last_processed().await == position }).await;
    assert_eq!(follower.handle.mode().await.unwrap(), Mode::Replay);
    assert_eq!(follower.instances().await, leader.instances().await);
    assert_eq!(follower.metrics.snapshot().last_processed_position, position);

    // Failover: the follower continues the key sequence without reusing keys
    leader.close().await;
    follower.become_leader(2).await;
    let key = follower.submit(create()).await.key().expect("instance key");
    assert!(keys.iter().all(|k| *k < key), "key {} reused or out of order: {:?}", key, keys);
    assert_eq!(follower.instances().await.len(), 4);
    follower.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poisoned_instance_is_blacklisted_and_skipped() {
    let dir = TempDir::new().unwrap();
    let logger = create_logger();
    let scheduler = ActorScheduler::for_current_runtime(logger.clone());
    let leader = Harness::start(&state_dir(&dir, "state"), MemoryLog::new(), config(), &scheduler, &logger);
    leader.become_leader(1).await;

    assert!(leader.submit(deploy(&["pick", "pack"])).await.is_accepted());
    let poisoned = leader.submit(create()).await.key().expect("instance key");
    let healthy = leader.submit(create()).await.key().expect("instance key");

    leader.faults.poison(poisoned);
    let response = leader.submit(complete(poisoned)).await;
    assert!(
        matches!(
            response,
            CommandResponse::Rejected {
                rejection_type: RejectionType::ProcessingError,
                ..
            }
        ),
        "unexpected response {:?}",
        response
    );
    assert!(leader.is_blacklisted(poisoned).await);
    assert_eq!(leader.metrics.snapshot().blacklist_size, 1);
    assert_eq!(leader.handle.phase().await.unwrap(), ErrorPhase::NoError);

    // Even once the engine could handle it again, the instance stays out
    leader.faults.heal();
    let skipped_before = leader.metrics.snapshot().skipped;
    let response = leader.submit(complete(poisoned)).await;
    assert!(matches!(
        response,
        CommandResponse::Rejected {
            rejection_type: RejectionType::InvalidState,
            ..
        }
    ));
    assert!(leader.metrics.snapshot().skipped > skipped_before);
    assert_eq!(leader.instance(poisoned).await.map(|i| i.task_index), Some(0));

    // Everything else keeps going
    assert!(leader.submit(complete(healthy)).await.is_accepted());
    assert_eq!(leader.instance(healthy).await.map(|i| i.task_index), Some(1));

    // Until an operator lifts the ban
    let unban = Command::UnbanInstance {
        process_instance_key: poisoned,
    };
    assert!(leader.submit(unban).await.is_accepted());
    assert!(!leader.is_blacklisted(poisoned).await);
    assert!(leader.submit(complete(poisoned)).await.is_accepted());
    assert_eq!(leader.instance(poisoned).await.map(|i| i.task_index), Some(1));
    leader.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_error_handling_reports_endless_loop() {
    let dir = TempDir::new().unwrap();
    let logger = create_logger();
    let scheduler = ActorScheduler::for_current_runtime(logger.clone());
    let leader = Harness::start(&state_dir(&dir, "state"), MemoryLog::new(), config(), &scheduler, &logger);
    leader.become_leader(1).await;

    leader.faults.poison(42);
    leader.faults.break_error_handling();
    let position = leader.append_internal(complete(42));

    let handle = &leader.handle;
    wait_until(move || async move { handle.phase().await.ok() == Some(ErrorPhase::EndlessErrorLoop) }).await;
    assert!(!leader.handle.is_making_progress().await.unwrap());
    assert!(leader.last_processed().await < position);

    let metrics = &leader.metrics;
    let retries = metrics.snapshot().retries;
    wait_until(move || async move { metrics.snapshot().retries > retries }).await;

    // Once the cause is gone the same record goes through
    leader.faults.heal();
    let replica = &leader;
    wait_until(move || async move { replica.last_processed().await == position }).await;
    assert!(leader.handle.is_making_progress().await.unwrap());
    assert_eq!(leader.handle.phase().await.unwrap(), ErrorPhase::NoError);
    leader.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_append_is_retried() {
    let dir = TempDir::new().unwrap();
    let logger = create_logger();
    let scheduler = ActorScheduler::for_current_runtime(logger.clone());
    let log = MemoryLog::new();
    let leader = Harness::start(&state_dir(&dir, "state"), log.clone(), config(), &scheduler, &logger);
    leader.become_leader(1).await;

    log.set_failing(true);
    let response = leader.submit_record(deploy(&["pick"]));
    let metrics = &leader.metrics;
    wait_until(move || async move { metrics.snapshot().retries >= 2 }).await;
    assert!(!response.is_done());
    // Only the leader's initial entry, which holds no records, is behind us
    assert_eq!(leader.last_processed().await, 0);

    log.set_failing(false);
    let response = tokio::time::timeout(TIMEOUT, response)
        .await
        .expect("response in time")
        .expect("response");
    assert!(response.is_accepted());
    // One deployment event, written once
    let deployed = log
        .records()
        .into_iter()
        .filter(|r| r.intent == Intent::Created)
        .count();
    assert_eq!(deployed, 1);
    leader.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshots_follow_the_processed_position() {
    let dir = TempDir::new().unwrap();
    let logger = create_logger();
    let scheduler = ActorScheduler::for_current_runtime(logger.clone());
    let log = MemoryLog::new();
    let leader = Harness::start(&state_dir(&dir, "state"), log.clone(), config(), &scheduler, &logger);
    leader.become_leader(1).await;

    assert!(leader.submit(deploy(&["pick"])).await.is_accepted());
    assert!(log.snapshots().is_empty(), "period 0 takes no snapshots on its own");

    let position = leader.last_processed().await;
    let id = leader
        .handle
        .take_snapshot()
        .await
        .expect("snapshot")
        .expect("newer than the last one");
    assert_eq!(id.index, position);
    assert_eq!(log.snapshots(), vec![id]);

    // Nothing processed since: no new snapshot
    assert_eq!(leader.handle.take_snapshot().await.expect("snapshot"), None);
    leader.close().await;

    let periodic = Harness::start(
        &state_dir(&dir, "periodic"),
        MemoryLog::new(),
        config().with_snapshot_period(2),
        &scheduler,
        &logger,
    );
    periodic.become_leader(1).await;
    assert!(periodic.submit(deploy(&["pick"])).await.is_accepted());
    periodic.submit(create()).await;
    let log = &periodic.log;
    wait_until(move || async move { !log.snapshots().is_empty() }).await;
    periodic.close().await;
}
