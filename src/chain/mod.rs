pub mod bitcoind;
pub mod monitor;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{BlockHash, Transaction, Txid};

pub use monitor::{BlockHandler, ChainMonitor, MonitorState};

/// A connected block as delivered to block handlers: the full ordered
/// transaction list plus the chain linkage the monitor walks.
#[derive(Debug, Clone)]
pub struct ChainBlock {
    pub hash: BlockHash,
    pub height: u64,
    pub next_block_hash: Option<BlockHash>,
    pub txdata: Vec<Transaction>,
}

/// Boundary to the full node supplying block data and accepting
/// transaction broadcasts.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_block_hash(&self, height: u64) -> Result<BlockHash>;

    async fn get_block(&self, hash: BlockHash) -> Result<ChainBlock>;

    async fn get_best_block_hash(&self) -> Result<BlockHash>;

    /// Submits the transaction to the network. Returns once the node has
    /// accepted it into its mempool; does not wait for confirmation.
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid>;
}
