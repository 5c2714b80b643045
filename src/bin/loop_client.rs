use std::path::PathBuf;
use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::secp256k1::rand::{RngCore as _, thread_rng};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, Txid};
use bitcoincore_rpc::Auth;
use clap::Parser as _;

use ln_loop_swap::chain::ChainSource as _;
use ln_loop_swap::chain::bitcoind::BitcoindChainSource;
use ln_loop_swap::htlc::{
    HtlcDescriptor, build_claim_tx, payment_hash, pubkey_hash_from_p2wpkh_address,
};

/// Counterparty-side helper for exercising a loop-out: generates the
/// swap secret, and claims the on-chain HTLC once the service funds it.
#[derive(Debug, clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Generates a fresh preimage, its payment hash, and a claim key.
    NewSwap {
        #[arg(long, default_value = "regtest")]
        network: Network,
    },

    /// Builds, signs, and broadcasts the claim transaction spending the
    /// HTLC's preimage path.
    Claim {
        #[arg(long, default_value = "http://127.0.0.1:18443")]
        bitcoind_url: String,

        #[arg(long)]
        bitcoind_user: Option<String>,

        #[arg(long)]
        bitcoind_pass: Option<String>,

        #[arg(long)]
        bitcoind_cookie: Option<PathBuf>,

        #[arg(long, default_value = "regtest")]
        network: Network,

        /// Txid of the HTLC funding transaction.
        #[arg(long)]
        htlc_txid: String,

        #[arg(long, default_value_t = 0)]
        htlc_vout: u32,

        #[arg(long)]
        htlc_value_sats: u64,

        /// Swap preimage, 32 bytes hex.
        #[arg(long)]
        preimage: String,

        /// Claim secret key, 32 bytes hex.
        #[arg(long)]
        claim_key: String,

        /// The service's refund address, as returned by the loop-out
        /// request.
        #[arg(long)]
        refund_address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_loop_swap::logging::init().ok();

    match Args::parse().command {
        Command::NewSwap { network } => new_swap(network),
        Command::Claim {
            bitcoind_url,
            bitcoind_user,
            bitcoind_pass,
            bitcoind_cookie,
            network,
            htlc_txid,
            htlc_vout,
            htlc_value_sats,
            preimage,
            claim_key,
            refund_address,
        } => {
            let auth = match (&bitcoind_user, &bitcoind_pass, &bitcoind_cookie) {
                (Some(user), Some(pass), _) => Auth::UserPass(user.clone(), pass.clone()),
                (_, _, Some(cookie)) => Auth::CookieFile(cookie.clone()),
                _ => Auth::None,
            };
            claim(
                &bitcoind_url,
                auth,
                network,
                &htlc_txid,
                htlc_vout,
                htlc_value_sats,
                &preimage,
                &claim_key,
                &refund_address,
            )
            .await
        }
    }
}

fn new_swap(network: Network) -> Result<()> {
    let secp = Secp256k1::new();

    let mut preimage = [0u8; 32];
    thread_rng().fill_bytes(&mut preimage);
    let hash = payment_hash(&preimage);

    let claim_key = SecretKey::new(&mut thread_rng());
    let claim_pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, &claim_key));
    let claim_address = Address::p2wpkh(&claim_pubkey, network);

    println!(
        "{}",
        serde_json::json!({
            "preimage": hex::encode(preimage),
            "hash": hash.to_string(),
            "claim_key": hex::encode(claim_key.secret_bytes()),
            "claim_address": claim_address.to_string(),
        })
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn claim(
    bitcoind_url: &str,
    auth: Auth,
    network: Network,
    htlc_txid: &str,
    htlc_vout: u32,
    htlc_value_sats: u64,
    preimage_hex: &str,
    claim_key_hex: &str,
    refund_address: &str,
) -> Result<()> {
    let secp = Secp256k1::new();

    let preimage: [u8; 32] = hex::decode(preimage_hex)
        .context("decode preimage hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;

    let claim_key = SecretKey::from_str(claim_key_hex).context("parse claim key")?;
    let claim_pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, &claim_key));
    let claim_address = Address::p2wpkh(&claim_pubkey, network);

    let refund_address = refund_address
        .parse::<Address<NetworkUnchecked>>()
        .context("parse refund address")?
        .require_network(network)
        .context("refund address network mismatch")?;

    let descriptor = HtlcDescriptor::new(
        payment_hash(&preimage),
        pubkey_hash_from_p2wpkh_address(&claim_address)?,
        pubkey_hash_from_p2wpkh_address(&refund_address)?,
    );

    let htlc_outpoint = OutPoint::new(
        Txid::from_str(htlc_txid).context("parse htlc txid")?,
        htlc_vout,
    );

    let tx = build_claim_tx(
        &descriptor,
        &preimage,
        &claim_key,
        Amount::from_sat(htlc_value_sats),
        htlc_outpoint,
    )
    .context("build claim tx")?;

    let chain = BitcoindChainSource::new(bitcoind_url, auth).context("connect bitcoind")?;
    let txid = chain
        .broadcast_transaction(&tx)
        .await
        .context("broadcast claim tx")?;

    tracing::info!(%txid, "claim transaction broadcast");
    println!("{txid}");
    Ok(())
}
