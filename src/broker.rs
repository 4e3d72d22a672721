//! Broker (Layer 6)
//!
//! Hosts every partition replica of one cluster member. All partitions share
//! one `TransportLayer` and `PartitionRouter`; the broker registers itself on
//! the `InProcessServer` as `node:<id>` and knows its peers by the same
//! addresses.
//!
//! The broker also owns the member's own `MemberState`, announcing partition
//! progress (joining, then active) as new versions, and merges the gossip it
//! receives about other members.

use crate::actor::{ActorFuture, ActorScheduler, FutureError};
use crate::config::{BrokerConfig, ConfigError};
use crate::engine::{Command, CommandResponse};
use crate::membership::{MemberRegistry, MemberState, MembershipError, PartitionState};
use crate::partition::{Partition, PartitionError};
use crate::transport::{InProcessMessageSender, InProcessServer, PartitionRouter, Transport, TransportLayer};
use slog::{info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("partition {partition}: {source}")]
    Partition {
        partition: u32,
        #[source]
        source: PartitionError,
    },

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("partition {0} is not hosted by this broker")]
    UnknownPartition(u32),
}

pub struct Broker {
    config: BrokerConfig,
    server: Arc<InProcessServer>,
    transport: Arc<TransportLayer>,
    partitions: BTreeMap<u32, Partition>,
    members: Mutex<MemberRegistry>,
    logger: Logger,
}

impl Broker {
    /// Join the in-process network and open partitions `1..=config.partitions`
    pub async fn start(
        config: BrokerConfig,
        server: Arc<InProcessServer>,
        scheduler: &ActorScheduler,
        logger: Logger,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let logger = logger.new(o!("node" => config.node_id));

        let router = Arc::new(PartitionRouter::new());
        let sender = Arc::new(InProcessMessageSender::new(server.clone(), config.node_id));
        let transport = Arc::new(TransportLayer::new(sender, router.clone()));

        let inbound = transport.clone();
        server.register_node(config.node_id, move |payload| inbound.deliver(&payload));
        for peer in config.cluster.iter().copied().filter(|id| *id != config.node_id) {
            transport
                .add_peer(peer, InProcessMessageSender::address_of(peer))
                .await;
        }

        let mut members = MemberRegistry::new(config.node_id, logger.clone());
        members.update_local(|state| state.to_joining())?;

        let priority = config.priority_of(config.node_id);
        let mut partitions = BTreeMap::new();
        for id in 1..=config.partitions {
            members.update_local(|state| Ok(state.with_partition(id, PartitionState::joining(priority))))?;
            let partition = Partition::open(
                &config,
                id,
                transport.clone(),
                router.clone(),
                scheduler,
                logger.clone(),
            )
            .await
            .map_err(|source| BrokerError::Partition { partition: id, source })?;
            partitions.insert(id, partition);
            members.update_local(|state| Ok(state.with_partition(id, PartitionState::active(priority))))?;
        }
        let local = members.update_local(|state| state.to_active())?;

        info!(logger, "Broker started";
            "cluster" => ?config.cluster, "partitions" => config.partitions,
            "member_version" => local.version);

        Ok(Self {
            config,
            server,
            transport,
            partitions,
            members: Mutex::new(members),
            logger,
        })
    }

    fn members(&self) -> MutexGuard<'_, MemberRegistry> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<TransportLayer> {
        &self.transport
    }

    pub fn partition(&self, id: u32) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn submit(&self, partition: u32, command: Command) -> ActorFuture<CommandResponse> {
        match self.partitions.get(&partition) {
            Some(target) => target.submit(command),
            None => ActorFuture::failed(FutureError::failed(BrokerError::UnknownPartition(partition))),
        }
    }

    /// The state this member gossips about itself
    pub fn local_state(&self) -> MemberState {
        self.members().local().clone()
    }

    /// This member's view of the cluster
    pub fn member_states(&self) -> Vec<MemberState> {
        self.members().members().cloned().collect()
    }

    /// Merge gossip from another member. Returns true if the view changed.
    pub fn receive_gossip(&self, state: MemberState) -> Result<bool, MembershipError> {
        let member = state.member_id;
        let outcome = self.members().merge(state);
        if let Err(e) = &outcome {
            warn!(self.logger, "Rejected member gossip"; "member" => member, "error" => %e);
        }
        outcome
    }

    /// Leave the cluster: announce it, close every partition and detach from the server
    pub async fn shutdown(&self) {
        if let Err(e) = self.members().update_local(|state| state.to_leaving()) {
            warn!(self.logger, "Cannot announce leaving"; "error" => %e);
        }
        for partition in self.partitions.values() {
            partition.close().await;
        }
        self.server.unregister_node(self.config.node_id);
        if let Err(e) = self.members().update_local(|state| state.to_left()) {
            warn!(self.logger, "Cannot announce having left"; "error" => %e);
        }
        info!(self.logger, "Broker stopped");
    }
}
