use clap::Parser;
use raftstream::actor::SchedulerConfig;
use raftstream::config::BrokerConfig;
use raftstream::engine::Command;
use raftstream::raft::Role;
use raftstream::transport::InProcessServer;
use raftstream::{ActorScheduler, Broker};
use slog::{error, info, o, warn, Drain, Logger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

const DEMO_PROCESS: &str = "demo";

#[derive(Parser, Debug)]
#[command(name = "raftstream")]
#[command(about = "Run an in-process raftstream cluster", long_about = None)]
struct Args {
    /// JSON broker configuration; command line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Id of the first member; members are numbered consecutively from it
    #[arg(short, long)]
    node_id: Option<u64>,

    /// Number of members in the cluster
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Number of partitions
    #[arg(short, long)]
    partitions: Option<u32>,

    /// Root directory for logs, state and snapshots
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Process instances to create and complete as demo load
    #[arg(long, default_value_t = 0)]
    commands: u64,
}

fn create_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn build_config(args: &Args) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };
    let first = args.node_id.unwrap_or(config.node_id);
    config.node_id = first;
    config.cluster = (first..first + args.nodes.max(1)).collect();
    if let Some(partitions) = args.partitions {
        config.partitions = partitions;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Broker currently leading `partition`, if any
async fn find_leader(brokers: &[Broker], partition: u32) -> Option<&Broker> {
    for broker in brokers {
        let Some(replica) = broker.partition(partition) else {
            continue;
        };
        if let Ok(Role::Leader) = replica.role().await {
            return Some(broker);
        }
    }
    None
}

async fn wait_for_leader(brokers: &[Broker], partition: u32) -> Option<&Broker> {
    for _ in 0..100 {
        if let Some(leader) = find_leader(brokers, partition).await {
            return Some(leader);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

async fn run_demo_load(brokers: &[Broker], count: u64, logger: &Logger) {
    let Some(leader) = wait_for_leader(brokers, 1).await else {
        warn!(logger, "No leader elected for partition 1, skipping demo load");
        return;
    };
    info!(logger, "Submitting demo load"; "leader" => leader.node_id(), "instances" => count);

    let deploy = Command::Deploy {
        process_id: DEMO_PROCESS.to_string(),
        tasks: vec!["reserve".to_string(), "ship".to_string()],
    };
    if let Err(e) = leader.submit(1, deploy).await {
        error!(logger, "Deployment failed"; "error" => %e);
        return;
    }

    let mut completed = 0;
    for n in 0..count {
        let create = Command::CreateInstance {
            process_id: DEMO_PROCESS.to_string(),
            variables: serde_json::json!({ "order": n }),
            tenant_id: None,
        };
        let key = match leader.submit(1, create).await {
            Ok(response) => match response.key() {
                Some(key) => key,
                None => continue,
            },
            Err(e) => {
                warn!(logger, "Instance creation failed"; "error" => %e);
                continue;
            }
        };
        for _ in 0..2 {
            let complete = Command::CompleteTask {
                process_instance_key: key,
            };
            if let Err(e) = leader.submit(1, complete).await {
                warn!(logger, "Task completion failed"; "key" => key, "error" => %e);
            }
        }
        completed += 1;
    }

    if let Some(partition) = leader.partition(1) {
        let metrics = partition.metrics_snapshot();
        info!(logger, "Demo load finished";
            "instances" => completed, "committed" => metrics.committed,
            "applied" => metrics.applied, "rejected" => metrics.rejected);
    }
}

/// Exchange every member's own state with every other member
fn gossip_round(brokers: &[Broker]) {
    let states: Vec<_> = brokers.iter().map(Broker::local_state).collect();
    for broker in brokers {
        for state in states.iter().filter(|s| s.member_id != broker.node_id()) {
            let _ = broker.receive_gossip(state.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let logger = create_logger();

    let config = build_config(&args)?;
    let scheduler = ActorScheduler::new(
        SchedulerConfig {
            cpu_threads: config.cpu_threads,
            io_threads: config.io_threads,
        },
        logger.clone(),
    )?;
    let server = Arc::new(InProcessServer::new());

    info!(logger, "Starting in-process cluster";
        "members" => ?config.cluster, "partitions" => config.partitions,
        "data_dir" => config.data_dir.display().to_string());

    let mut brokers = Vec::new();
    for node_id in config.cluster.clone() {
        let mut member = config.clone();
        member.node_id = node_id;
        brokers.push(Broker::start(member, server.clone(), &scheduler, logger.clone()).await?);
    }
    gossip_round(&brokers);

    if args.commands > 0 {
        run_demo_load(&brokers, args.commands, &logger).await;
    }

    info!(logger, "Cluster running, press Ctrl-C to stop");
    let mut gossip = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = gossip.tick() => gossip_round(&brokers),
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(logger, "Failed to listen for Ctrl-C"; "error" => %e);
                }
                break;
            }
        }
    }

    info!(logger, "Shutting down");
    for broker in &brokers {
        broker.shutdown().await;
    }
    Ok(())
}
