use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use bitcoincore_rpc::Auth;
use clap::Parser as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};

use ln_loop_swap::chain::bitcoind::BitcoindChainSource;
use ln_loop_swap::chain::{ChainMonitor, ChainSource};
use ln_loop_swap::lightning::lnd::LndInvoiceService;
use ln_loop_swap::swap::LoopOutRequestParams;
use ln_loop_swap::swap::manager::RequestManager;
use ln_loop_swap::wallet::Wallet;

/// Loop-out service daemon. Reads loop-out requests as JSON lines on
/// stdin and answers each with a JSON response on stdout; the HTTP
/// surface in front of this is deployment-specific.
#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:18443")]
    bitcoind_url: String,

    #[arg(long)]
    bitcoind_user: Option<String>,

    #[arg(long)]
    bitcoind_pass: Option<String>,

    /// Path to bitcoind's .cookie file; used when no user/pass is given.
    #[arg(long)]
    bitcoind_cookie: Option<PathBuf>,

    #[arg(long, default_value = "https://127.0.0.1:10009")]
    lnd_endpoint: String,

    #[arg(long)]
    lnd_tls_cert: Option<PathBuf>,

    #[arg(long)]
    lnd_macaroon: Option<PathBuf>,

    #[arg(long, default_value = "regtest")]
    network: Network,

    #[arg(long, default_value_t = 1_000)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_loop_swap::logging::init().ok();

    let args = Args::parse();

    let auth = match (&args.bitcoind_user, &args.bitcoind_pass, &args.bitcoind_cookie) {
        (Some(user), Some(pass), _) => Auth::UserPass(user.clone(), pass.clone()),
        (_, _, Some(cookie)) => Auth::CookieFile(cookie.clone()),
        _ => Auth::None,
    };

    let chain: Arc<dyn ChainSource> =
        Arc::new(BitcoindChainSource::new(&args.bitcoind_url, auth).context("connect bitcoind")?);

    let invoices = Arc::new(
        LndInvoiceService::connect(
            args.lnd_endpoint.clone(),
            args.lnd_tls_cert.as_deref(),
            args.lnd_macaroon.as_deref(),
        )
        .await
        .context("connect lnd")?,
    );

    let monitor = Arc::new(ChainMonitor::new(
        chain.clone(),
        Duration::from_millis(args.poll_interval_ms),
    ));
    let wallet = Arc::new(Wallet::new(chain.clone(), args.network));
    let manager = Arc::new(RequestManager::new(
        wallet.clone(),
        invoices,
        args.network,
    ));

    // Wallet bookkeeping runs before settlement detection on every block.
    monitor.add_connected_handler(wallet.clone());
    monitor.add_connected_handler(manager.clone());

    let deposit_address = wallet.new_address();
    tracing::info!(%deposit_address, "send funds here to provision the service wallet");

    let monitor_task = {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor.start().await {
                tracing::error!(error = %err, "chain monitor stopped");
            }
        })
    };

    tracing::info!(network = %args.network, "loop-out service ready, awaiting requests on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let params: LoopOutRequestParams = match serde_json::from_str(line) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(error = %err, "malformed loop-out request");
                continue;
            }
        };

        match manager.handle_request(&params).await {
            Ok(response) => {
                println!(
                    "{}",
                    serde_json::to_string(&response).context("encode response")?
                );
            }
            Err(err) => {
                tracing::error!(hash = %params.hash, error = %err, "loop-out request failed");
            }
        }
    }

    monitor.stop();
    monitor_task.await.context("join monitor task")?;
    Ok(())
}
