use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::{BlockHash, Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi as _};

use super::{ChainBlock, ChainSource};

/// Chain source backed by a bitcoind JSON-RPC endpoint. The underlying
/// client is blocking, so every call runs on the blocking pool.
pub struct BitcoindChainSource {
    client: Arc<Client>,
}

impl BitcoindChainSource {
    pub fn new(url: &str, auth: Auth) -> Result<Self> {
        let client = Client::new(url, auth).with_context(|| format!("connect bitcoind {url}"))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl ChainSource for BitcoindChainSource {
    async fn get_block_hash(&self, height: u64) -> Result<BlockHash> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.get_block_hash(height))
            .await
            .context("join getblockhash")?
            .with_context(|| format!("getblockhash {height}"))
    }

    async fn get_block(&self, hash: BlockHash) -> Result<ChainBlock> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || -> Result<ChainBlock> {
            let info = client
                .get_block_info(&hash)
                .with_context(|| format!("getblock info {hash}"))?;
            let block = client
                .get_block(&hash)
                .with_context(|| format!("getblock {hash}"))?;

            Ok(ChainBlock {
                hash,
                height: info.height as u64,
                next_block_hash: info.nextblockhash,
                txdata: block.txdata,
            })
        })
        .await
        .context("join getblock")?
    }

    async fn get_best_block_hash(&self) -> Result<BlockHash> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.get_best_block_hash())
            .await
            .context("join getbestblockhash")?
            .context("getbestblockhash")
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid> {
        let client = self.client.clone();
        let raw = bitcoin::consensus::encode::serialize_hex(tx);
        tokio::task::spawn_blocking(move || client.send_raw_transaction(raw.as_str()))
            .await
            .context("join sendrawtransaction")?
            .context("sendrawtransaction")
    }
}
