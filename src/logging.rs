use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Reads `RUST_LOG` and falls
/// back to `info` for this crate.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ln_loop_swap=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
