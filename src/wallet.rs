use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::rand::thread_rng;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, EcdsaSighashType, Network, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use thiserror::Error;

use crate::chain::{BlockHandler, ChainBlock, ChainSource};

/// Fixed funding-transaction fee. A production wallet would estimate a
/// fee rate and size the fee to the transaction.
pub const FUNDING_TX_FEE: Amount = Amount::from_sat(244);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet owns no spendable outputs")]
    NoFundsAvailable,
    #[error("utxo value {available} cannot cover outputs {required} plus fee")]
    InsufficientFunds { available: Amount, required: Amount },
}

/// An output the wallet controls, together with the key that can spend it.
#[derive(Debug, Clone)]
struct UnspentOutput {
    value: Amount,
    script_pubkey: ScriptBuf,
    key: SecretKey,
}

struct WalletState {
    /// Watched P2WPKH script-pubkey to owning key.
    watched: HashMap<ScriptBuf, SecretKey>,
    /// Outputs currently owned and unspent.
    owned: HashMap<OutPoint, UnspentOutput>,
}

/// Minimal UTXO-tracking wallet: generates keys, watches their P2WPKH
/// scripts in connected blocks, and funds and signs transactions from
/// whatever single output happens to be available. No coin selection is
/// performed beyond "first available".
pub struct Wallet {
    chain: Arc<dyn ChainSource>,
    network: Network,
    secp: Secp256k1<All>,
    state: Mutex<WalletState>,
}

impl Wallet {
    pub fn new(chain: Arc<dyn ChainSource>, network: Network) -> Self {
        Self {
            chain,
            network,
            secp: Secp256k1::new(),
            state: Mutex::new(WalletState {
                watched: HashMap::new(),
                owned: HashMap::new(),
            }),
        }
    }

    /// Generates a fresh key and starts watching its P2WPKH script in
    /// connected blocks.
    pub fn create_key(&self) -> SecretKey {
        let mut state = self.lock_state();
        self.create_key_locked(&mut state)
    }

    fn create_key_locked(&self, state: &mut MutexGuard<'_, WalletState>) -> SecretKey {
        let key = SecretKey::new(&mut thread_rng());
        let script_pubkey = self.p2wpkh_script(&key);
        tracing::debug!(address = %self.p2wpkh_address(&key), "watching wallet address");
        state.watched.insert(script_pubkey, key);
        key
    }

    /// A fresh deposit address controlled by the wallet.
    pub fn new_address(&self) -> Address {
        let key = self.create_key();
        self.p2wpkh_address(&key)
    }

    pub fn p2wpkh_address(&self, key: &SecretKey) -> Address {
        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&self.secp, key));
        Address::p2wpkh(&pubkey, self.network)
    }

    fn p2wpkh_script(&self, key: &SecretKey) -> ScriptBuf {
        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&self.secp, key));
        ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
    }

    /// Any currently owned outpoint, or `NoFundsAvailable` if the wallet
    /// owns nothing.
    pub fn available_utxo(&self) -> Result<OutPoint> {
        let state = self.lock_state();
        state
            .owned
            .keys()
            .next()
            .copied()
            .ok_or_else(|| WalletError::NoFundsAvailable.into())
    }

    /// Total value of owned outputs.
    pub fn balance(&self) -> Amount {
        let state = self.lock_state();
        state
            .owned
            .values()
            .fold(Amount::ZERO, |acc, u| acc + u.value)
    }

    pub fn owned_outpoints(&self) -> Vec<OutPoint> {
        self.lock_state().owned.keys().copied().collect()
    }

    /// Funds a partially built transaction in place: adds one owned
    /// output as the funding input, appends a change output to a fresh
    /// wallet key after deducting the fixed fee, and signs the funding
    /// input. Does not broadcast.
    pub fn fund_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let mut state = self.lock_state();

        let (outpoint, utxo) = state
            .owned
            .iter()
            .map(|(op, u)| (*op, u.clone()))
            .next()
            .ok_or(WalletError::NoFundsAvailable)?;

        let required = tx
            .output
            .iter()
            .try_fold(Amount::ZERO, |acc, out| acc.checked_add(out.value))
            .context("output value overflow")?;

        let change_value = utxo
            .value
            .checked_sub(FUNDING_TX_FEE)
            .and_then(|v| v.checked_sub(required))
            .ok_or(WalletError::InsufficientFunds {
                available: utxo.value,
                required,
            })?;

        let change_key = self.create_key_locked(&mut state);
        drop(state);

        let input_index = tx.input.len();
        tx.input.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        });
        tx.output.push(TxOut {
            value: change_value,
            script_pubkey: self.p2wpkh_script(&change_key),
        });

        let sighash = SighashCache::new(&*tx)
            .p2wpkh_signature_hash(
                input_index,
                &utxo.script_pubkey,
                utxo.value,
                EcdsaSighashType::All,
            )
            .context("compute funding sighash")?;
        let msg = bitcoin::secp256k1::Message::from_digest(sighash.to_byte_array());
        let mut signature = self
            .secp
            .sign_ecdsa(&msg, &utxo.key)
            .serialize_der()
            .to_vec();
        signature.push(EcdsaSighashType::All as u8);

        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&self.secp, &utxo.key));
        tx.input[input_index].witness =
            Witness::from_slice(&[signature.as_slice(), &pubkey.to_bytes()]);

        Ok(())
    }

    /// Forwards a signed transaction to the chain source. Does not wait
    /// for confirmation.
    pub async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = self
            .chain
            .broadcast_transaction(tx)
            .await
            .context("broadcast transaction")?;
        tracing::info!(%txid, "broadcast transaction");
        Ok(txid)
    }

    fn lock_state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().expect("wallet mutex poisoned")
    }
}

/// An empty transaction ready to receive outputs before being handed to
/// `fund_transaction`.
pub fn empty_transaction() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: Vec::new(),
        output: Vec::new(),
    }
}

#[async_trait]
impl BlockHandler for Wallet {
    /// Applies a block's effects atomically: receives and spends are
    /// both detected against the UTXO set as it existed before the
    /// block, so a same-block output never becomes spendable within the
    /// same pass.
    async fn block_connected(&self, block: &ChainBlock) {
        let mut state = self.lock_state();

        let mut received: Vec<(OutPoint, UnspentOutput)> = Vec::new();
        let mut spent: Vec<OutPoint> = Vec::new();

        for tx in &block.txdata {
            for input in &tx.input {
                if state.owned.contains_key(&input.previous_output) {
                    spent.push(input.previous_output);
                }
            }

            let txid = tx.compute_txid();
            for (vout, output) in tx.output.iter().enumerate() {
                if let Some(key) = state.watched.get(&output.script_pubkey) {
                    received.push((
                        OutPoint::new(txid, vout as u32),
                        UnspentOutput {
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            key: *key,
                        },
                    ));
                }
            }
        }

        for outpoint in spent {
            if let Some(utxo) = state.owned.remove(&outpoint) {
                tracing::info!(%outpoint, value = %utxo.value, "spent utxo");
            }
        }
        for (outpoint, utxo) in received {
            tracing::info!(%outpoint, value = %utxo.value, "received utxo");
            state.owned.insert(outpoint, utxo);
        }
    }
}
