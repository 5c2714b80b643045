use std::collections::HashMap;

use bitcoin::OutPoint;
use bitcoin::hashes::sha256;

use super::{LoopOutRequest, RequestState, SwapError};

/// In-process store of open loop-out requests, keyed by payment hash.
/// Request state is process-resident only; a production service would
/// need a durable log to survive restarts.
#[derive(Default)]
pub struct RequestStore {
    requests: HashMap<sha256::Hash, LoopOutRequest>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new request. At most one open request may exist per
    /// hash.
    pub fn insert(&mut self, request: LoopOutRequest) -> Result<(), SwapError> {
        let hash = request.hash;
        if self.requests.contains_key(&hash) {
            return Err(SwapError::DuplicateRequest(hash));
        }
        self.requests.insert(hash, request);
        Ok(())
    }

    pub fn get(&self, hash: &sha256::Hash) -> Option<&LoopOutRequest> {
        self.requests.get(hash)
    }

    pub fn get_mut(&mut self, hash: &sha256::Hash) -> Option<&mut LoopOutRequest> {
        self.requests.get_mut(hash)
    }

    pub fn remove(&mut self, hash: &sha256::Hash) -> Option<LoopOutRequest> {
        self.requests.remove(hash)
    }

    /// HTLC outpoints of requests awaiting on-chain settlement, mapped
    /// to their hashes.
    pub fn awaited_htlc_outpoints(&self) -> HashMap<OutPoint, sha256::Hash> {
        self.requests
            .values()
            .filter(|r| r.state == RequestState::AwaitingOutgoingHtlcSettlement)
            .filter_map(|r| r.htlc_outpoint.map(|op| (op, r.hash)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
