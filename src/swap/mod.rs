pub mod manager;
pub mod store;

use bitcoin::hashes::sha256;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, Amount, OutPoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("loop-out request already exists for hash {0}")]
    DuplicateRequest(sha256::Hash),
    #[error("no loop-out request for hash {0}")]
    NotFound(sha256::Hash),
}

/// Lifecycle of a loop-out request. `Complete` is terminal; the store
/// entry is removed on reaching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    AwaitingIncomingHtlcAccepted,
    AwaitingOutgoingHtlcSettlement,
    Complete,
}

/// One in-flight swap attempt. The payment hash is immutable and is the
/// sole lookup key; the remaining fields are assigned as the request
/// moves through the pipeline.
#[derive(Debug, Clone)]
pub struct LoopOutRequest {
    pub hash: sha256::Hash,
    /// The remote party's P2WPKH claim address, fixed at creation.
    pub claim_address: Address,
    pub requested_value: Amount,
    /// Service fee, assigned when the request enters the pipeline.
    pub fee_value: Amount,
    /// Blocks added to the hold invoice's CLTV expiry.
    pub final_expiry_delta: u32,
    /// The service's key for the HTLC timeout branch.
    pub refund_key: Option<SecretKey>,
    /// Outpoint of the HTLC output, assigned once the funding
    /// transaction is built.
    pub htlc_outpoint: Option<OutPoint>,
    pub payment_request: Option<String>,
    pub state: RequestState,
}

impl LoopOutRequest {
    pub fn new(claim_address: Address, hash: sha256::Hash, requested_value: Amount) -> Self {
        Self {
            hash,
            claim_address,
            requested_value,
            fee_value: Amount::ZERO,
            final_expiry_delta: 0,
            refund_key: None,
            htlc_outpoint: None,
            payment_request: None,
            state: RequestState::Pending,
        }
    }
}

/// Inbound swap request as submitted by the remote party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutRequestParams {
    pub claim_address: String,
    /// 32-byte payment hash, hex encoded.
    pub hash: String,
    pub requested_value_sats: u64,
}

/// Response handed back to the remote party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutResponse {
    pub refund_address: String,
    pub payment_request: String,
}
