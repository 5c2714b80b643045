#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

use ln_loop_swap::chain::{ChainBlock, ChainSource};
use ln_loop_swap::lightning::{InvoiceEvents, InvoiceService};

/// In-memory linear chain for driving the monitor and handlers.
#[derive(Default)]
pub struct MockChain {
    blocks: Mutex<Vec<ChainBlock>>,
    pub broadcasts: Mutex<Vec<Transaction>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block containing `txdata` and returns its hash.
    /// Heights start at 1.
    pub fn push_block(&self, txdata: Vec<Transaction>) -> BlockHash {
        let mut blocks = self.blocks.lock().expect("blocks mutex poisoned");
        let height = blocks.len() as u64 + 1;

        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&height.to_le_bytes());
        let hash = BlockHash::from_byte_array(bytes);

        blocks.push(ChainBlock {
            hash,
            height,
            next_block_hash: None,
            txdata,
        });
        hash
    }

    pub fn block_at(&self, height: u64) -> ChainBlock {
        let blocks = self.blocks.lock().expect("blocks mutex poisoned");
        self.linked_block(&blocks, height as usize - 1)
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().expect("broadcasts poisoned").len()
    }

    pub fn broadcasted(&self, index: usize) -> Transaction {
        self.broadcasts.lock().expect("broadcasts poisoned")[index].clone()
    }

    fn linked_block(&self, blocks: &[ChainBlock], index: usize) -> ChainBlock {
        let mut block = blocks[index].clone();
        block.next_block_hash = blocks.get(index + 1).map(|b| b.hash);
        block
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn get_block_hash(&self, height: u64) -> Result<BlockHash> {
        let blocks = self.blocks.lock().expect("blocks mutex poisoned");
        blocks
            .get(height as usize - 1)
            .map(|b| b.hash)
            .with_context(|| format!("no block at height {height}"))
    }

    async fn get_block(&self, hash: BlockHash) -> Result<ChainBlock> {
        let blocks = self.blocks.lock().expect("blocks mutex poisoned");
        let index = blocks
            .iter()
            .position(|b| b.hash == hash)
            .with_context(|| format!("no block {hash}"))?;
        Ok(self.linked_block(&blocks, index))
    }

    async fn get_best_block_hash(&self) -> Result<BlockHash> {
        let blocks = self.blocks.lock().expect("blocks mutex poisoned");
        blocks.last().map(|b| b.hash).context("empty chain")
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        self.broadcasts
            .lock()
            .expect("broadcasts poisoned")
            .push(tx.clone());
        Ok(txid)
    }
}

/// Hold-invoice collaborator double. Generates real signed BOLT11
/// payment requests so hash verification in the manager is exercised,
/// records settle calls, and mirrors lnd by firing the settled event
/// when an invoice is settled.
pub struct MockInvoices {
    node_key: SecretKey,
    pub invoices: Mutex<Vec<(sha256::Hash, Amount, u32)>>,
    pub settles: Mutex<Vec<Vec<u8>>>,
    watchers: Mutex<HashMap<sha256::Hash, Arc<dyn InvoiceEvents>>>,
}

impl MockInvoices {
    pub fn new() -> Self {
        Self {
            node_key: SecretKey::from_slice(&[0x42; 32]).expect("static key"),
            invoices: Mutex::new(Vec::new()),
            settles: Mutex::new(Vec::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn fire_accepted(&self, hash: sha256::Hash) {
        let watcher = self
            .watchers
            .lock()
            .expect("watchers poisoned")
            .get(&hash)
            .cloned();
        if let Some(watcher) = watcher {
            watcher.invoice_accepted(hash).await;
        }
    }

    pub fn settle_count(&self) -> usize {
        self.settles.lock().expect("settles poisoned").len()
    }

    pub fn settled_preimage(&self, index: usize) -> Vec<u8> {
        self.settles.lock().expect("settles poisoned")[index].clone()
    }
}

#[async_trait]
impl InvoiceService for MockInvoices {
    async fn generate_hold_invoice(
        &self,
        hash: sha256::Hash,
        value: Amount,
        cltv_expiry: u32,
    ) -> Result<String> {
        self.invoices
            .lock()
            .expect("invoices poisoned")
            .push((hash, value, cltv_expiry));

        let secp = Secp256k1::new();
        let invoice = InvoiceBuilder::new(Currency::Regtest)
            .description("loop-out".to_string())
            .payment_hash(hash)
            .payment_secret(PaymentSecret([0x11; 32]))
            .amount_milli_satoshis(value.to_sat() * 1_000)
            .min_final_cltv_expiry_delta(cltv_expiry as u64)
            .current_timestamp()
            .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, &self.node_key))
            .map_err(|e| anyhow::anyhow!("build invoice: {e:?}"))?;

        Ok(invoice.to_string())
    }

    async fn watch_invoice(
        &self,
        hash: sha256::Hash,
        events: Arc<dyn InvoiceEvents>,
    ) -> Result<()> {
        self.watchers
            .lock()
            .expect("watchers poisoned")
            .insert(hash, events);
        Ok(())
    }

    async fn settle_invoice(&self, preimage: &[u8]) -> Result<()> {
        self.settles
            .lock()
            .expect("settles poisoned")
            .push(preimage.to_vec());

        let preimage: [u8; 32] = preimage
            .try_into()
            .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
        let hash = sha256::Hash::hash(&preimage);

        let watcher = self
            .watchers
            .lock()
            .expect("watchers poisoned")
            .remove(&hash);
        if let Some(watcher) = watcher {
            watcher.invoice_settled(hash).await;
        }
        Ok(())
    }
}

/// A minimal transaction paying `value` to `script_pubkey`, optionally
/// spending the given outpoints.
pub fn pay_to(script_pubkey: ScriptBuf, value: Amount, spends: Vec<OutPoint>) -> Transaction {
    let input = spends
        .into_iter()
        .map(|previous_output| TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
        .collect();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: vec![TxOut {
            value,
            script_pubkey,
        }],
    }
}

/// Polls `check` until it returns true or the timeout elapses.
pub async fn wait_until<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
