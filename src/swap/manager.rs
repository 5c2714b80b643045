use std::str::FromStr as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, TxOut};

use crate::chain::{BlockHandler, ChainBlock};
use crate::htlc::{HtlcClaimWitness, HtlcDescriptor, pubkey_hash_from_p2wpkh_address};
use crate::lightning::invoice::payment_hash_from_bolt11;
use crate::lightning::{InvoiceEvents, InvoiceService};
use crate::swap::store::RequestStore;
use crate::swap::{LoopOutRequest, LoopOutRequestParams, LoopOutResponse, RequestState};
use crate::wallet::{Wallet, empty_transaction};

/// Fixed service fee charged on top of the requested value.
pub const LOOP_OUT_FEE: Amount = Amount::from_sat(1_000);

/// Blocks added to the invoice CLTV expiry for the final hop.
pub const FINAL_EXPIRY_DELTA: u32 = 40;

/// Base CLTV expiry the hold invoice carries before the final delta.
const INVOICE_CLTV_BASE: u32 = 40;

/// Orchestrates loop-out requests: reacts to invoice lifecycle events
/// and connected blocks, and drives each request through its state
/// machine. The only component holding business policy.
pub struct RequestManager {
    wallet: Arc<Wallet>,
    invoices: Arc<dyn InvoiceService>,
    network: Network,
    store: Mutex<RequestStore>,
    best_height: AtomicU64,
}

impl RequestManager {
    pub fn new(wallet: Arc<Wallet>, invoices: Arc<dyn InvoiceService>, network: Network) -> Self {
        Self {
            wallet,
            invoices,
            network,
            store: Mutex::new(RequestStore::new()),
            best_height: AtomicU64::new(0),
        }
    }

    /// Height of the most recently connected block.
    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::Relaxed)
    }

    pub fn open_requests(&self) -> usize {
        self.lock_store().len()
    }

    pub fn request_state(&self, hash: &sha256::Hash) -> Option<RequestState> {
        self.lock_store().get(hash).map(|r| r.state)
    }

    /// Parses and validates an inbound request from the remote party and
    /// enters it into the pipeline.
    pub async fn handle_request(
        self: &Arc<Self>,
        params: &LoopOutRequestParams,
    ) -> Result<LoopOutResponse> {
        let hash = sha256::Hash::from_str(&params.hash).context("parse payment hash")?;
        let claim_address = params
            .claim_address
            .parse::<Address<NetworkUnchecked>>()
            .context("parse claim address")?
            .require_network(self.network)
            .context("claim address network mismatch")?;
        let requested_value = Amount::from_sat(params.requested_value_sats);

        self.add_request(LoopOutRequest::new(claim_address, hash, requested_value))
            .await
    }

    /// Starts a loop-out: stores the request, assigns the refund key and
    /// fee, generates the hold invoice the remote party must pay, and
    /// registers for its state changes.
    pub async fn add_request(
        self: &Arc<Self>,
        mut request: LoopOutRequest,
    ) -> Result<LoopOutResponse> {
        // Fail fast on anything that can never fund.
        pubkey_hash_from_p2wpkh_address(&request.claim_address)
            .context("claim address must be P2WPKH")?;

        let hash = request.hash;
        let refund_key = self.wallet.create_key();
        request.fee_value = LOOP_OUT_FEE;
        request.final_expiry_delta = FINAL_EXPIRY_DELTA;
        request.refund_key = Some(refund_key);

        let invoice_value = request
            .requested_value
            .checked_add(request.fee_value)
            .context("invoice value overflow")?;
        let cltv_expiry = INVOICE_CLTV_BASE + request.final_expiry_delta;

        self.lock_store().insert(request)?;

        let payment_request = match self.issue_invoice(hash, invoice_value, cltv_expiry).await {
            Ok(payment_request) => payment_request,
            Err(err) => {
                // No usable invoice was handed out; drop the entry so
                // the same hash can be retried from scratch.
                self.lock_store().remove(&hash);
                return Err(err);
            }
        };

        {
            let mut store = self.lock_store();
            if let Some(req) = store.get_mut(&hash) {
                req.payment_request = Some(payment_request.clone());
                req.state = RequestState::AwaitingIncomingHtlcAccepted;
            }
        }

        Ok(LoopOutResponse {
            refund_address: self.wallet.p2wpkh_address(&refund_key).to_string(),
            payment_request,
        })
    }

    /// Generates the hold invoice, checks that it commits to the
    /// expected payment hash, and registers for its state changes.
    async fn issue_invoice(
        self: &Arc<Self>,
        hash: sha256::Hash,
        value: Amount,
        cltv_expiry: u32,
    ) -> Result<String> {
        let payment_request = self
            .invoices
            .generate_hold_invoice(hash, value, cltv_expiry)
            .await
            .context("generate hold invoice")?;

        let invoice_hash =
            payment_hash_from_bolt11(&payment_request).context("parse hold invoice")?;
        anyhow::ensure!(
            invoice_hash == hash,
            "invoice payment hash {invoice_hash} does not match request hash {hash}"
        );
        tracing::debug!(%hash, %payment_request, "generated hold invoice");

        self.invoices
            .watch_invoice(hash, self.clone())
            .await
            .context("watch hold invoice")?;

        Ok(payment_request)
    }

    /// Builds the HTLC funding transaction for an accepted request:
    /// output 0 pays the requested value to the P2WSH HTLC, the wallet
    /// adds the funding input and change.
    fn build_htlc_tx(
        &self,
        request: &LoopOutRequest,
        refund_key: &SecretKey,
    ) -> Result<bitcoin::Transaction> {
        let secp = Secp256k1::new();
        let claim_pubkey_hash = pubkey_hash_from_p2wpkh_address(&request.claim_address)
            .context("claim address pubkey hash")?;
        let refund_pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, refund_key));
        let descriptor = HtlcDescriptor::new(
            request.hash,
            claim_pubkey_hash,
            refund_pubkey.wpubkey_hash().to_byte_array(),
        );

        let mut tx = empty_transaction();
        tx.output.push(TxOut {
            value: request.requested_value,
            script_pubkey: descriptor.script_pubkey(),
        });

        self.wallet
            .fund_transaction(&mut tx)
            .context("fund htlc transaction")?;
        Ok(tx)
    }

    async fn settle_htlc_spends(&self, block: &ChainBlock) {
        // Preimages are extracted under the lock; the settle calls run
        // after it is dropped.
        let mut settlements: Vec<(sha256::Hash, Vec<u8>)> = Vec::new();
        {
            let store = self.lock_store();
            let awaited = store.awaited_htlc_outpoints();
            if awaited.is_empty() {
                return;
            }

            for tx in &block.txdata {
                for input in &tx.input {
                    let Some(hash) = awaited.get(&input.previous_output) else {
                        continue;
                    };
                    let Some(witness) = HtlcClaimWitness::from_witness(&input.witness) else {
                        tracing::warn!(
                            %hash,
                            outpoint = %input.previous_output,
                            "htlc spend with unexpected witness shape"
                        );
                        continue;
                    };
                    // An empty preimage element means the refund path
                    // was taken, which is not a claim.
                    if witness.preimage.is_empty() {
                        tracing::debug!(%hash, "htlc spent via refund path");
                        continue;
                    }
                    settlements.push((*hash, witness.preimage));
                }
            }
        }

        for (hash, preimage) in settlements {
            tracing::info!(%hash, "htlc claimed on-chain, settling invoice");
            if let Err(err) = self.invoices.settle_invoice(&preimage).await {
                tracing::warn!(%hash, error = %err, "settle invoice failed");
            }
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, RequestStore> {
        self.store.lock().expect("request store mutex poisoned")
    }
}

#[async_trait]
impl InvoiceEvents for RequestManager {
    /// The incoming payment is locked in: fund and broadcast the
    /// on-chain HTLC.
    async fn invoice_accepted(&self, hash: sha256::Hash) {
        tracing::info!(%hash, "hold invoice accepted");

        let (request, refund_key) = {
            let store = self.lock_store();
            let Some(request) = store.get(&hash) else {
                tracing::warn!(%hash, "invoice accepted for unknown loop-out request");
                return;
            };
            let Some(refund_key) = request.refund_key else {
                tracing::warn!(%hash, "loop-out request has no refund key");
                return;
            };
            (request.clone(), refund_key)
        };

        let tx = match self.build_htlc_tx(&request, &refund_key) {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(%hash, error = %err, "building htlc transaction failed");
                return;
            }
        };

        // The HTLC is always output 0; the wallet appends change after it.
        let htlc_outpoint = OutPoint::new(tx.compute_txid(), 0);
        {
            let mut store = self.lock_store();
            if let Some(req) = store.get_mut(&hash) {
                req.htlc_outpoint = Some(htlc_outpoint);
                req.state = RequestState::AwaitingOutgoingHtlcSettlement;
            }
        }

        if let Err(err) = self.wallet.broadcast(&tx).await {
            // The request stays in AwaitingOutgoingHtlcSettlement; the
            // transaction is signed and can be rebroadcast.
            tracing::error!(%hash, error = %err, "broadcasting htlc transaction failed");
        }
    }

    /// The invoice was settled with the preimage revealed on-chain; the
    /// swap is complete.
    async fn invoice_settled(&self, hash: sha256::Hash) {
        let mut store = self.lock_store();
        let Some(mut request) = store.remove(&hash) else {
            tracing::warn!(%hash, "invoice settled for unknown loop-out request");
            return;
        };
        request.state = RequestState::Complete;
        tracing::info!(%hash, "loop-out complete");
    }
}

#[async_trait]
impl BlockHandler for RequestManager {
    async fn block_connected(&self, block: &ChainBlock) {
        self.best_height.store(block.height, Ordering::Relaxed);
        self.settle_htlc_spends(block).await;
    }
}
