use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;
use tracing::info;

use crate::common::crypto::Keypair;
use crate::consensus::config::ReplicaConfig;
use crate::consensus::error::PbftResult;
use crate::consensus::message::ReplicaId;
use crate::consensus::peers::Peers;
use crate::consensus::processor::ConsensusProcessor;
use crate::consensus::replica::{CommittedRequest, Replica};
use super::LocalNetwork;

const CHANNEL_SIZE: usize = 1024;

/// Everything needed to start one replica.
pub struct Node {
    pub config: ReplicaConfig,
    pub keypair: Keypair,
    pub peers: Peers,
}

/// A running replica attached to a LocalNetwork.
pub struct NodeHandle {
    pub id: ReplicaId,
    processor: JoinHandle<Replica>,
    router: JoinHandle<()>,
}

impl Node {
    pub fn new(config: ReplicaConfig, keypair: Keypair, peers: Peers) -> Self {
        Node { config, keypair, peers }
    }

    /// Starts the replica; the receiver yields its requests in execution order.
    pub fn spawn(self, network: &Arc<LocalNetwork>) -> PbftResult<(NodeHandle, Receiver<CommittedRequest>)> {
        let id = self.config.id;
        let replica = Replica::new(&self.config, self.keypair, self.peers)?;

        let (in_tx, in_rx) = mpsc::channel(CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_SIZE);
        let (commit_tx, commit_rx) = mpsc::channel(CHANNEL_SIZE);
        network.register_replica(id, in_tx);
        let router = network.spawn_router(id, out_rx);

        let mut processor = ConsensusProcessor::new(replica, in_rx, out_tx, commit_tx);
        let processor = tokio::spawn(async move {
            processor.run().await;
            processor.replica
        });
        info!(replica = id, "node started");

        Ok((NodeHandle { id, processor, router }, commit_rx))
    }
}

impl NodeHandle {
    /// Detaches the replica from the network and returns its final state.
    pub async fn shutdown(self, network: &LocalNetwork) -> Option<Replica> {
        network.deregister_replica(self.id);
        let replica = self.processor.await.ok();
        self.router.abort();
        replica
    }
}
