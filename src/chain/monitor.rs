use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::BlockHash;

use super::{ChainBlock, ChainSource};

/// Height the initial sync starts from. Target networks are regtest-like
/// and cheap to walk from the beginning; a production wallet would track
/// a birth height instead.
const SYNC_START_HEIGHT: u64 = 1;

/// Receiver of connected blocks. Handlers are awaited one at a time, so
/// a handler sees every block exactly once and never observes block N+1
/// before every handler has finished block N.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn block_connected(&self, block: &ChainBlock);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Syncing,
    Watching,
    Stopped,
}

/// Connects to a block source and drives registered handlers with an
/// ordered, gap-free sequence of connected blocks: an initial linear
/// sync from the start height, then a poll loop for new tips.
///
/// Reorganizations are not handled; the monitor assumes a single
/// monotonically extending chain.
pub struct ChainMonitor {
    source: Arc<dyn ChainSource>,
    poll_interval: Duration,
    handlers: Mutex<Vec<Arc<dyn BlockHandler>>>,
    state: Mutex<MonitorState>,
    best_block_hash: Mutex<Option<BlockHash>>,
}

impl ChainMonitor {
    pub fn new(source: Arc<dyn ChainSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
            handlers: Mutex::new(Vec::new()),
            state: Mutex::new(MonitorState::Idle),
            best_block_hash: Mutex::new(None),
        }
    }

    /// Registers a block-connected handler. Handlers are invoked in
    /// registration order for every block.
    pub fn add_connected_handler(&self, handler: Arc<dyn BlockHandler>) {
        self.handlers
            .lock()
            .expect("handlers mutex poisoned")
            .push(handler);
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Hash of the most recently connected block, if any block has been
    /// processed yet.
    pub fn best_block_hash(&self) -> Option<BlockHash> {
        *self
            .best_block_hash
            .lock()
            .expect("best hash mutex poisoned")
    }

    /// Syncs to the current tip, invoking handlers for every block on
    /// the way, then watches for newly connected blocks until `stop` is
    /// called. Runs until stopped; callers normally spawn it.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            anyhow::ensure!(
                *state == MonitorState::Idle,
                "monitor already started (state {:?})",
                *state
            );
            *state = MonitorState::Syncing;
        }

        self.sync().await.context("initial sync")?;

        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state == MonitorState::Syncing {
                *state = MonitorState::Watching;
            }
        }

        self.watch().await;
        Ok(())
    }

    /// Stops the watch loop. An in-flight block-processing pass still
    /// runs to completion.
    pub fn stop(&self) {
        *self.state.lock().expect("state mutex poisoned") = MonitorState::Stopped;
    }

    async fn sync(&self) -> Result<()> {
        let mut hash = self
            .source
            .get_block_hash(SYNC_START_HEIGHT)
            .await
            .context("fetch sync start block hash")?;

        loop {
            let block = self
                .source
                .get_block(hash)
                .await
                .with_context(|| format!("fetch block {hash}"))?;

            self.connect_block(&block).await;

            match block.next_block_hash {
                Some(next) => hash = next,
                None => break,
            }
        }

        tracing::info!(best_block_hash = %hash, "chain sync complete");
        Ok(())
    }

    async fn watch(&self) {
        while self.state() == MonitorState::Watching {
            match self.advance_tip().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(err) => {
                    // Failing to poll is a liveness problem, not a
                    // correctness one. Log and retry.
                    tracing::warn!(error = %err, "chain poll failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Connects the successor of the best known block if one exists.
    /// Returns whether a block was connected.
    async fn advance_tip(&self) -> Result<bool> {
        let best = self
            .best_block_hash()
            .context("watch started before sync")?;

        let current = self
            .source
            .get_block(best)
            .await
            .with_context(|| format!("fetch best block {best}"))?;

        let Some(next) = current.next_block_hash else {
            return Ok(false);
        };

        let block = self
            .source
            .get_block(next)
            .await
            .with_context(|| format!("fetch next block {next}"))?;
        self.connect_block(&block).await;
        Ok(true)
    }

    async fn connect_block(&self, block: &ChainBlock) {
        *self
            .best_block_hash
            .lock()
            .expect("best hash mutex poisoned") = Some(block.hash);

        tracing::debug!(
            height = block.height,
            hash = %block.hash,
            txs = block.txdata.len(),
            "block connected"
        );

        let handlers: Vec<Arc<dyn BlockHandler>> = self
            .handlers
            .lock()
            .expect("handlers mutex poisoned")
            .clone();
        for handler in handlers {
            handler.block_connected(block).await;
        }
    }
}
