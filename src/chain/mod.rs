use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::crypto::{short, Digest, Hashable, Hasher};
use crate::consensus::config::GenesisConfig;
use crate::consensus::message::RequestClient;
use crate::consensus::replica::CommittedRequest;

/*
    Glue between the ordered commit stream and a block chain. Blocks travel
    through consensus as ordinary client requests whose operation is the
    bincode encoding of the block; once committed, every replica appends
    them to its chain in execution order.
*/

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block at height {got} does not extend the chain at height {tip}")]
    HeightMismatch { tip: u64, got: u64 },

    #[error("block parent {parent} is not the current tip {tip}")]
    ParentMismatch { tip: String, parent: String },

    #[error("committed request is not a block: {0}")]
    Decode(#[from] bincode::Error),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Tx {
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub parent_hash: Digest,
    pub block_time: u64,
    pub txs: Vec<Tx>,
}

impl Hashable for Tx {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"tx");
        hasher.bytes(&self.payload);
        hasher.finish()
    }
}

impl Hashable for Block {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"block");
        hasher.u64(self.height).digest(&self.parent_hash).u64(self.block_time);
        hasher.u64(self.txs.len() as u64);
        for tx in &self.txs {
            hasher.digest(&tx.hash());
        }
        hasher.finish()
    }
}

/// What the consensus layer needs from the chain it orders blocks for.
pub trait BlockchainClient {
    fn get_current_block(&self) -> Block;
    fn write_block(&mut self, parent_state_hash: Digest, block: Block) -> Result<(), ChainError>;
    fn request_tx(&mut self, max_count: usize, exclude: &[Digest]) -> Vec<Tx>;
    fn set_current_block(&mut self, block: Block);
    /// Creates the genesis block if the chain is empty.
    fn init_block(&mut self);
}

/// Packs mempool transactions into blocks and applies committed ones.
pub struct BlockProposer<C: BlockchainClient> {
    client: C,
    name: String,
    max_txs: usize,
    next_timestamp: u64,
}

impl<C: BlockchainClient> BlockProposer<C> {
    pub fn new(mut client: C, name: impl Into<String>, max_txs: usize) -> Self {
        client.init_block();
        BlockProposer { client, name: name.into(), max_txs, next_timestamp: 0 }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// A request carrying the next block on top of the current tip, or
    /// `None` while the mempool is empty.
    pub fn create_block(&mut self, block_time: u64) -> Result<Option<RequestClient>, ChainError> {
        let current = self.client.get_current_block();
        let txs = self.client.request_tx(self.max_txs, &[]);
        if txs.is_empty() {
            debug!(height = current.height, "no transactions to pack");
            return Ok(None);
        }

        let block = Block {
            height: current.height + 1,
            parent_hash: current.hash(),
            block_time,
            txs,
        };
        info!(height = block.height, txs = block.txs.len(), "proposing block");
        self.next_timestamp += 1;
        let op = bincode::serialize(&block)?;
        Ok(Some(RequestClient::new(self.name.clone(), self.next_timestamp, op)))
    }

    /// Appends a committed block. Blocks must arrive in chain order.
    pub fn write_committed(&mut self, committed: &CommittedRequest) -> Result<Block, ChainError> {
        let block: Block = bincode::deserialize(&committed.request.op)?;
        let current = self.client.get_current_block();
        if block.height != current.height + 1 {
            return Err(ChainError::HeightMismatch { tip: current.height, got: block.height });
        }
        let tip = current.hash();
        if block.parent_hash != tip {
            return Err(ChainError::ParentMismatch { tip: short(&tip), parent: short(&block.parent_hash) });
        }

        self.client.write_block(tip, block.clone())?;
        self.client.set_current_block(block.clone());
        info!(height = block.height, seq = committed.sequence, "block written");
        Ok(block)
    }
}

/// In-memory chain with a simple mempool.
pub struct MemoryChain {
    genesis: GenesisConfig,
    blocks: Vec<Block>,
    current: Option<Block>,
    mempool: Vec<Tx>,
}

impl MemoryChain {
    pub fn new(genesis: GenesisConfig) -> Self {
        MemoryChain { genesis, blocks: Vec::new(), current: None, mempool: Vec::new() }
    }

    pub fn add_tx(&mut self, tx: Tx) {
        self.mempool.push(tx);
    }

    pub fn height(&self) -> u64 {
        self.get_current_block().height
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    fn genesis_block(&self) -> Block {
        Block {
            height: 0,
            parent_hash: [0u8; 32],
            block_time: self.genesis.genesis_block_time,
            txs: vec![Tx { payload: self.genesis.genesis.as_bytes().to_vec() }],
        }
    }
}

impl BlockchainClient for MemoryChain {
    fn get_current_block(&self) -> Block {
        match &self.current {
            Some(block) => block.clone(),
            None => self.genesis_block(),
        }
    }

    fn write_block(&mut self, parent_state_hash: Digest, block: Block) -> Result<(), ChainError> {
        let tip = self.get_current_block();
        if parent_state_hash != tip.hash() {
            return Err(ChainError::ParentMismatch { tip: short(&tip.hash()), parent: short(&parent_state_hash) });
        }
        let included: Vec<Digest> = block.txs.iter().map(|tx| tx.hash()).collect();
        self.mempool.retain(|tx| !included.contains(&tx.hash()));
        self.blocks.push(block);
        Ok(())
    }

    fn request_tx(&mut self, max_count: usize, exclude: &[Digest]) -> Vec<Tx> {
        self.mempool
            .iter()
            .filter(|tx| !exclude.contains(&tx.hash()))
            .take(max_count)
            .cloned()
            .collect()
    }

    fn set_current_block(&mut self, block: Block) {
        self.current = Some(block);
    }

    fn init_block(&mut self) {
        if !self.blocks.is_empty() {
            return;
        }
        let genesis = self.genesis_block();
        if self.genesis.genesis.is_empty() {
            warn!("empty genesis string in config");
        }
        info!(time = genesis.block_time, "creating genesis block");
        self.blocks.push(genesis.clone());
        self.current = Some(genesis);
    }
}
