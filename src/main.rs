use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use simple_pbft::chain::{BlockProposer, MemoryChain, Tx};
use simple_pbft::common::crypto::{Hashable, Keypair};
use simple_pbft::consensus::{ClientHandle, CommittedRequest, Peers, ReplicaConfig};
use simple_pbft::network::node::Node;
use simple_pbft::network::LocalNetwork;

/*
    Runs a local PBFT cluster in one process. Every replica keeps its own
    in-memory chain fed from its commit stream; a client packs mempool
    transactions into blocks and submits each block as a request.

    Usage: simple-pbft [config.toml]

    The config's id is ignored, every replica 1..=n is started from it. A
    wal_path names a directory holding one request log per replica.
*/

const ROUNDS: u64 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let template = match std::env::args().nth(1) {
        Some(path) => ReplicaConfig::load(Path::new(&path)).with_context(|| format!("loading config {}", path))?,
        None => ReplicaConfig::new(1, 1, 4),
    };
    info!(n = template.n, f = template.f, k = template.checkpoint_period, "starting local cluster");

    if let Some(dir) = &template.wal_path {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let keypairs: Vec<Keypair> = (0..template.n).map(|_| Keypair::new_pair()).collect();
    let peers = Peers::new(keypairs.iter().map(|k| k.pubkey()).collect());
    let network = LocalNetwork::new();

    let mut handles = Vec::new();
    let mut chains = Vec::new();
    for (i, keypair) in keypairs.into_iter().enumerate() {
        let mut config = template.clone();
        config.id = i as u64 + 1;
        config.wal_path = template.wal_path.as_ref().map(|path| path.join(format!("replica-{}.wal", config.id)));
        let (handle, mut commit_rx) = Node::new(config, keypair, peers.clone())
            .spawn(&network)
            .with_context(|| format!("starting replica {}", i + 1))?;
        handles.push(handle);

        let id = i as u64 + 1;
        let mut chain = BlockProposer::new(MemoryChain::new(template.genesis.clone()), format!("replica-{}", id), 0);
        chains.push(tokio::spawn(async move {
            while let Some(committed) = commit_rx.recv().await {
                if let Err(err) = chain.write_committed(&committed) {
                    warn!(replica = id, %err, seq = committed.sequence, "committed request not applied");
                }
            }
            chain.client().height()
        }));
    }

    let mut client = ClientHandle::connect("proposer", template.f, network.clone());
    let mut proposer = BlockProposer::new(MemoryChain::new(template.genesis.clone()), "proposer", 16);
    for round in 0..ROUNDS {
        for i in 0..4u64 {
            proposer.client_mut().add_tx(Tx { payload: (round * 4 + i).to_be_bytes().to_vec() });
        }
        let Some(request) = proposer.create_block(unix_time())? else {
            continue;
        };
        client.submit(&request).await;

        let reply = tokio::time::timeout(Duration::from_secs(30), client.replies.recv())
            .await
            .context("timed out waiting for replies")?
            .context("client reply channel closed")?;
        let committed = CommittedRequest {
            view: reply.view,
            sequence: reply.sequence,
            digest: request.hash(),
            request,
        };
        let block = proposer.write_committed(&committed)?;
        info!(height = block.height, seq = reply.sequence, view = reply.view, "block confirmed by f+1 replicas");
    }

    for handle in handles {
        let id = handle.id;
        if let Some(replica) = handle.shutdown(&network).await {
            info!(replica = id, view = replica.view, last_exec = replica.last_exec, h = replica.h, "replica stopped");
        }
    }
    for (i, chain) in chains.into_iter().enumerate() {
        let height = chain.await.context("chain task failed")?;
        info!(replica = i + 1, height, "final chain height");
    }
    Ok(())
}

fn unix_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}
