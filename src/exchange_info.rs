//! Periodic mirror of the exchange-info metadata blob.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backoff::DelayIterator;
use crate::fetch::{fetch_bytes, FetchError};
use crate::market::MarketClass;
use crate::stream::StreamDeps;

/// Poll cadence for the exchange-info body.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic REST poll of `exchangeInfo`, serving the latest raw body.
///
/// Readers block on a one-shot latch that fires after the first successful
/// fetch; during a ban the poll degrades to a no-op until recovery.
pub struct ExchangeInfoService {
    class: MarketClass,
    deps: StreamDeps,
    body: RwLock<Option<Arc<Vec<u8>>>>,
    ready_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExchangeInfoService {
    #[must_use]
    pub fn new(class: MarketClass, deps: StreamDeps) -> Arc<Self> {
        debug!(
            "{class} exchangeInfo initialization with refresh of {}s",
            REFRESH_INTERVAL.as_secs()
        );
        let (ready_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            class,
            deps,
            body: RwLock::new(None),
            ready_tx,
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the poll loop. Idempotent enough for a single owner.
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(service.poll_loop());
        *self.task.lock() = Some(handle);
    }

    /// Signal the poller to stop.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Await poller exit, bounded by `grace`.
    pub async fn join(&self, grace: Duration) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("{} exchangeInfo poller did not exit within {grace:?}", self.class);
            }
        }
    }

    /// Latest body; blocks until the first successful fetch has landed.
    pub async fn get(&self) -> Option<Arc<Vec<u8>>> {
        let mut ready = self.ready_tx.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
        self.body.read().clone()
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut tick = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stop.wait_for(|s| *s) => break,
            }
            tokio::select! {
                () = self.refresh_with_retry() => {}
                _ = stop.wait_for(|s| *s) => break,
            }
        }
        // Release readers blocked on a body that will never come.
        self.ready_tx.send_replace(true);
        debug!("{} exchangeInfo poller stopped", self.class);
    }

    async fn refresh_with_retry(&self) {
        let mut retry = DelayIterator::new();
        loop {
            match self.refresh().await {
                Ok(()) => return,
                Err(FetchError::Banned) => {
                    // No point hammering a banned class; the next tick
                    // re-checks after recovery.
                    debug!("{} exchangeInfo refresh skipped during API ban", self.class);
                    return;
                }
                Err(e) => {
                    error!("{} exchangeInfo refresh failed: {e}", self.class);
                    retry.delay().await;
                }
            }
        }
    }

    async fn refresh(&self) -> Result<(), FetchError> {
        let body = fetch_bytes(
            &self.deps.http,
            &self.deps.quota,
            &self.deps.limiter,
            self.class,
            self.class.exchange_info_path(),
            &[],
        )
        .await?;

        *self.body.write() = Some(Arc::new(body));
        self.ready_tx.send_replace(true);
        debug!("{} exchangeInfo refreshed successfully", self.class);
        Ok(())
    }
}
