mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use ln_loop_swap::chain::{BlockHandler, ChainBlock, ChainMonitor, MonitorState};
use support::{MockChain, wait_until};

struct Recorder {
    tag: &'static str,
    log: Arc<Mutex<Vec<(&'static str, u64)>>>,
}

#[async_trait]
impl BlockHandler for Recorder {
    async fn block_connected(&self, block: &ChainBlock) {
        self.log
            .lock()
            .expect("log poisoned")
            .push((self.tag, block.height));
    }
}

fn log_len(log: &Arc<Mutex<Vec<(&'static str, u64)>>>) -> usize {
    log.lock().expect("log poisoned").len()
}

#[tokio::test(flavor = "multi_thread")]
async fn syncs_then_watches_in_height_order() {
    let chain = Arc::new(MockChain::new());
    for _ in 0..3 {
        chain.push_block(Vec::new());
    }

    let monitor = Arc::new(ChainMonitor::new(chain.clone(), Duration::from_millis(10)));
    let log = Arc::new(Mutex::new(Vec::new()));
    monitor.add_connected_handler(Arc::new(Recorder {
        tag: "a",
        log: log.clone(),
    }));

    assert_eq!(monitor.state(), MonitorState::Idle);
    assert!(monitor.best_block_hash().is_none());

    let task = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.start().await })
    };

    assert!(
        wait_until(|| log_len(&log) == 3, Duration::from_secs(5)).await,
        "initial sync did not deliver all blocks"
    );
    assert_eq!(
        *log.lock().expect("log poisoned"),
        vec![("a", 1), ("a", 2), ("a", 3)]
    );
    assert!(
        wait_until(
            || monitor.state() == MonitorState::Watching,
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(monitor.best_block_hash(), Some(chain.block_at(3).hash));

    // A new tip is picked up by the poll loop.
    let tip = chain.push_block(Vec::new());
    assert!(
        wait_until(|| log_len(&log) == 4, Duration::from_secs(5)).await,
        "watch loop did not connect the new tip"
    );
    assert_eq!(log.lock().expect("log poisoned")[3], ("a", 4));
    assert_eq!(monitor.best_block_hash(), Some(tip));

    monitor.stop();
    task.await.expect("join monitor").expect("monitor result");
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_run_in_registration_order() {
    let chain = Arc::new(MockChain::new());
    chain.push_block(Vec::new());
    chain.push_block(Vec::new());

    let monitor = Arc::new(ChainMonitor::new(chain.clone(), Duration::from_millis(10)));
    let log = Arc::new(Mutex::new(Vec::new()));
    monitor.add_connected_handler(Arc::new(Recorder {
        tag: "first",
        log: log.clone(),
    }));
    monitor.add_connected_handler(Arc::new(Recorder {
        tag: "second",
        log: log.clone(),
    }));

    let task = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.start().await })
    };

    assert!(wait_until(|| log_len(&log) == 4, Duration::from_secs(5)).await);
    assert_eq!(
        *log.lock().expect("log poisoned"),
        vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
    );

    monitor.stop();
    task.await.expect("join monitor").expect("monitor result");
}

#[tokio::test(flavor = "multi_thread")]
async fn start_is_rejected_once_running() {
    let chain = Arc::new(MockChain::new());
    chain.push_block(Vec::new());

    let monitor = Arc::new(ChainMonitor::new(chain, Duration::from_millis(10)));
    let task = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.start().await })
    };

    assert!(
        wait_until(
            || monitor.state() == MonitorState::Watching,
            Duration::from_secs(5)
        )
        .await
    );
    let err = monitor.start().await.expect_err("second start must fail");
    assert!(err.to_string().contains("already started"));

    monitor.stop();
    task.await.expect("join monitor").expect("monitor result");
}
