use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::opcodes;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, EcdsaSighashType, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};
use thiserror::Error;

/// Default relative-timelock delay, in blocks, before the refund branch
/// becomes spendable.
pub const DEFAULT_TIMEOUT_DELAY: u16 = 40;

/// Fixed claim-transaction fee at 1 sat/vbyte for the single-input,
/// single-output claim shape.
pub const CLAIM_TX_FEE: Amount = Amount::from_sat(141);

#[derive(Debug, Error)]
pub enum HtlcError {
    #[error("htlc value {value} cannot cover claim fee {fee}")]
    InsufficientValue { value: Amount, fee: Amount },
}

/// Parameters of the hash-or-timeout redeem script. Building the script
/// twice from the same descriptor yields byte-identical output, which is
/// what makes script-pubkey matching against observed blocks possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcDescriptor {
    pub payment_hash: sha256::Hash,
    pub claim_pubkey_hash: [u8; 20],
    pub refund_pubkey_hash: [u8; 20],
    pub timeout_delay: u16,
}

impl HtlcDescriptor {
    pub fn new(
        payment_hash: sha256::Hash,
        claim_pubkey_hash: [u8; 20],
        refund_pubkey_hash: [u8; 20],
    ) -> Self {
        Self {
            payment_hash,
            claim_pubkey_hash,
            refund_pubkey_hash,
            timeout_delay: DEFAULT_TIMEOUT_DELAY,
        }
    }

    /// The BIP199-style redeem script: the preimage path pays the claim
    /// key, the timeout path pays the refund key after `timeout_delay`
    /// blocks (CHECKSEQUENCEVERIFY).
    pub fn redeem_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(self.payment_hash.to_byte_array())
            .push_opcode(opcodes::all::OP_EQUAL)
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(self.claim_pubkey_hash)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.timeout_delay as i64)
            .push_opcode(opcodes::all::OP_CSV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(self.refund_pubkey_hash)
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }

    /// The segwit-v0 P2WSH script-pubkey committing to the redeem script.
    /// This is the value compared byte-for-byte against transaction
    /// outputs in connected blocks.
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.redeem_script().wscript_hash())
    }
}

/// Named layout of the witness stack that spends the claim branch of the
/// HTLC. Stack order is consensus-critical: `[signature, public_key,
/// preimage, redeem_script]`.
#[derive(Debug, Clone)]
pub struct HtlcClaimWitness {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub preimage: Vec<u8>,
    pub redeem_script: Vec<u8>,
}

impl HtlcClaimWitness {
    pub fn to_witness(&self) -> Witness {
        Witness::from_slice(&[
            self.signature.as_slice(),
            self.public_key.as_slice(),
            self.preimage.as_slice(),
            self.redeem_script.as_slice(),
        ])
    }

    /// Reads an HTLC spend witness back into its named parts. A
    /// refund-path spend carries an empty preimage element in the same
    /// position.
    pub fn from_witness(witness: &Witness) -> Option<Self> {
        if witness.len() != 4 {
            return None;
        }
        Some(Self {
            signature: witness.nth(0)?.to_vec(),
            public_key: witness.nth(1)?.to_vec(),
            preimage: witness.nth(2)?.to_vec(),
            redeem_script: witness.nth(3)?.to_vec(),
        })
    }
}

/// Builds and signs the transaction that claims the HTLC output through
/// the preimage path, paying `htlc_value` less the fixed claim fee to
/// the claim key's P2WPKH address.
pub fn build_claim_tx(
    descriptor: &HtlcDescriptor,
    preimage: &[u8; 32],
    claim_key: &SecretKey,
    htlc_value: Amount,
    htlc_outpoint: OutPoint,
) -> Result<Transaction> {
    let claim_value = htlc_value
        .checked_sub(CLAIM_TX_FEE)
        .filter(|v| *v > Amount::ZERO)
        .ok_or(HtlcError::InsufficientValue {
            value: htlc_value,
            fee: CLAIM_TX_FEE,
        })?;

    let secp = Secp256k1::new();
    let claim_pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, claim_key));
    let redeem_script = descriptor.redeem_script();

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: htlc_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: claim_value,
            script_pubkey: ScriptBuf::new_p2wpkh(&claim_pubkey.wpubkey_hash()),
        }],
    };

    let sighash = SighashCache::new(&tx)
        .p2wsh_signature_hash(0, &redeem_script, htlc_value, EcdsaSighashType::All)
        .context("compute claim sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let mut signature = secp.sign_ecdsa(&msg, claim_key).serialize_der().to_vec();
    signature.push(EcdsaSighashType::All as u8);

    let witness = HtlcClaimWitness {
        signature,
        public_key: claim_pubkey.to_bytes().to_vec(),
        preimage: preimage.to_vec(),
        redeem_script: redeem_script.to_bytes(),
    };
    tx.input[0].witness = witness.to_witness();

    Ok(tx)
}

/// Extracts the 20-byte witness program (the pubkey hash) from a P2WPKH
/// script-pubkey.
pub fn pubkey_hash_from_p2wpkh_script(script_pubkey: &ScriptBuf) -> Result<[u8; 20]> {
    let bytes = script_pubkey.as_bytes();
    if bytes.len() != 22 || bytes[0] != 0x00 || bytes[1] != 0x14 {
        anyhow::bail!("expected P2WPKH script_pubkey (0x0014..), got {script_pubkey:?}");
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[2..22]);
    Ok(out)
}

pub fn pubkey_hash_from_p2wpkh_address(address: &Address) -> Result<[u8; 20]> {
    pubkey_hash_from_p2wpkh_script(&address.script_pubkey())
}

/// SHA-256 of the preimage, the value committed to by both the invoice
/// and the HTLC script.
pub fn payment_hash(preimage: &[u8; 32]) -> sha256::Hash {
    sha256::Hash::hash(preimage)
}
