mod common;

use common::create_logger;
use raftstream::actor::ActorScheduler;
use raftstream::config::{BrokerConfig, ProcessorConfig, RaftConfig};
use raftstream::engine::{Command, CommandResponse};
use raftstream::membership::{MemberStatus, PartitionStatus};
use raftstream::raft::{AppendError, Role};
use raftstream::transport::InProcessServer;
use raftstream::Broker;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MEMBERS: [u64; 3] = [1, 2, 3];
const TIMEOUT: Duration = Duration::from_secs(10);

async fn start_cluster(dir: &TempDir, server: &Arc<InProcessServer>, scheduler: &ActorScheduler) -> Vec<Broker> {
    let raft = RaftConfig::default().with_tick_interval(Duration::from_millis(10));
    let processor = ProcessorConfig::default().with_processing_retry_delay(Duration::from_millis(20));
    let mut brokers = Vec::new();
    for id in MEMBERS {
        let config = BrokerConfig::new(id, MEMBERS.to_vec(), dir.path())
            .with_raft(raft.clone())
            .with_processor(processor.clone());
        let broker = Broker::start(config, server.clone(), scheduler, create_logger())
            .await
            .expect("start broker");
        brokers.push(broker);
    }
    brokers
}

/// Index of the broker leading partition 1, ignoring `excluded` members
async fn wait_for_leader(brokers: &[Broker], excluded: &[u64], min_term: u64) -> usize {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        for (n, broker) in brokers.iter().enumerate() {
            if excluded.contains(&broker.node_id()) {
                continue;
            }
            let status = broker.partition(1).expect("partition 1").status().await.expect("status");
            if status.role == Role::Leader && status.term >= min_term {
                return n;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader for partition 1 within {:?}", TIMEOUT);
}

async fn submit(broker: &Broker, command: Command) -> CommandResponse {
    tokio::time::timeout(TIMEOUT, broker.submit(1, command))
        .await
        .expect("response in time")
        .expect("command answered")
}

/// Wait until `broker`'s replica applied the instance
async fn wait_for_instance(broker: &Broker, key: u64) {
    let partition = broker.partition(1).expect("partition 1");
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if partition.instance(key).await.expect("query").is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("node {} never applied instance {}", broker.node_id(), key);
}

fn deploy() -> Command {
    Command::Deploy {
        process_id: "shipment".to_string(),
        tasks: vec!["label".to_string(), "dispatch".to_string()],
    }
}

fn create(n: u64) -> Command {
    Command::CreateInstance {
        process_id: "shipment".to_string(),
        variables: serde_json::json!({ "parcel": n }),
        tenant_id: None,
    }
}

fn gossip_round(brokers: &[Broker]) {
    let states: Vec<_> = brokers.iter().map(Broker::local_state).collect();
    for broker in brokers {
        for state in states.iter().filter(|s| s.member_id != broker.node_id()) {
            broker.receive_gossip(state.clone()).expect("valid gossip");
        }
    }
}

async fn shutdown(brokers: &[Broker]) {
    for broker in brokers {
        broker.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commands_replicate_to_every_member() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(InProcessServer::new());
    let scheduler = ActorScheduler::for_current_runtime(create_logger());
    let brokers = start_cluster(&dir, &server, &scheduler).await;

    let leader = &brokers[wait_for_leader(&brokers, &[], 0).await];
    assert!(submit(leader, deploy()).await.is_accepted());
    let key = submit(leader, create(1)).await.key().expect("instance key");

    for broker in &brokers {
        wait_for_instance(broker, key).await;
    }

    // Followers refuse commands instead of answering from stale state
    let follower = brokers
        .iter()
        .find(|b| b.node_id() != leader.node_id())
        .expect("a follower");
    let refused = tokio::time::timeout(TIMEOUT, follower.submit(1, create(2)))
        .await
        .expect("refused in time")
        .expect_err("followers do not accept commands");
    assert!(
        matches!(refused.downcast_ref::<AppendError>(), Some(AppendError::NotLeader { .. })),
        "unexpected error: {}",
        refused
    );

    // Committed records reach readers on every member
    let records = follower
        .partition(1)
        .expect("partition 1")
        .read_committed(1, 100)
        .await
        .expect("read committed");
    assert!(records.iter().any(|r| r.key == Some(key)));

    shutdown(&brokers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_is_replaced() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(InProcessServer::new());
    let scheduler = ActorScheduler::for_current_runtime(create_logger());
    let brokers = start_cluster(&dir, &server, &scheduler).await;

    let old = &brokers[wait_for_leader(&brokers, &[], 0).await];
    assert!(submit(old, deploy()).await.is_accepted());
    let first = submit(old, create(1)).await.key().expect("instance key");
    let old_term = old.partition(1).unwrap().status().await.unwrap().term;

    server.isolate(old.node_id());
    let new = &brokers[wait_for_leader(&brokers, &[old.node_id()], old_term + 1).await];
    assert_ne!(new.node_id(), old.node_id());

    // The deployment survived the change of leadership
    let second = submit(new, create(2)).await.key().expect("instance key");
    assert_ne!(first, second);

    server.reconnect(old.node_id());
    wait_for_instance(old, second).await;
    let status = old.partition(1).unwrap().status().await.unwrap();
    assert_ne!(status.role, Role::Leader, "a stale leader must step down");

    shutdown(&brokers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gossip_converges_on_member_states() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(InProcessServer::new());
    let scheduler = ActorScheduler::for_current_runtime(create_logger());
    let brokers = start_cluster(&dir, &server, &scheduler).await;

    gossip_round(&brokers);
    for broker in &brokers {
        let states = broker.member_states();
        assert_eq!(states.len(), MEMBERS.len());
        for state in &states {
            assert_eq!(state.state, MemberStatus::Active);
            assert_eq!(state.partitions[&1].state, PartitionStatus::Active);
        }
    }

    // Replaying old gossip changes nothing
    let stale = brokers[1].local_state();
    assert!(!brokers[0].receive_gossip(stale).expect("valid gossip"));

    // Nobody else may speak for a member with a newer version of its state
    let mut forged = brokers[0].local_state();
    forged.version += 10;
    assert!(brokers[0].receive_gossip(forged).is_err());

    brokers[2].shutdown().await;
    let left = brokers[2].local_state();
    assert_eq!(left.state, MemberStatus::Left);
    assert!(brokers[0].receive_gossip(left).expect("valid gossip"));
    let seen = brokers[0]
        .member_states()
        .into_iter()
        .find(|s| s.member_id == 3)
        .expect("member 3");
    assert_eq!(seen.state, MemberStatus::Left);

    shutdown(&brokers[..2]).await;
}
