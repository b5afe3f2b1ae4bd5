//! Per-class ownership of instrument streams.
//!
//! Lazy creation on first request, race-free via single-winner map
//! insertion; a background sweeper evicts streams nobody has read for
//! twice their natural refresh horizon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::exchange_info::ExchangeInfoService;
use crate::market::{interval_duration, InstrumentKey, MarketClass};
use crate::stream::depth::{DepthSnapshot, DepthStream};
use crate::stream::klines::{KlineSnapshot, KlineStream};
use crate::stream::ticker::{Ticker24h, TickerStream};
use crate::stream::{InstrumentStream, StreamDeps, StreamKind};

/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Idle horizon for depth and ticker streams, and the fallback for kline
/// streams whose interval is not recognized.
const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(120);

/// Budget for winding everything down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct StreamEntry<K: StreamKind> {
    stream: Arc<InstrumentStream<K>>,
    last_access: Instant,
}

/// Owner of all live streams for one market class.
pub struct Registry {
    class: MarketClass,
    deps: StreamDeps,
    klines: DashMap<InstrumentKey, StreamEntry<KlineStream>>,
    depth: DashMap<InstrumentKey, StreamEntry<DepthStream>>,
    ticker: DashMap<InstrumentKey, StreamEntry<TickerStream>>,
    exchange_info: Arc<ExchangeInfoService>,
    stop_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Create the registry and start its sweeper and exchange-info poller.
    #[must_use]
    pub fn new(class: MarketClass, deps: StreamDeps) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let exchange_info = ExchangeInfoService::new(class, deps.clone());
        exchange_info.start();

        let registry = Arc::new(Self {
            class,
            deps,
            klines: DashMap::new(),
            depth: DashMap::new(),
            ticker: DashMap::new(),
            exchange_info,
            stop_tx,
            sweeper: Mutex::new(None),
        });

        let sweeper = tokio::spawn(Self::sweep_loop(Arc::clone(&registry)));
        *registry.sweeper.lock() = Some(sweeper);
        registry
    }

    /// Kline window for `(symbol, interval)`, creating the stream on first
    /// use and blocking until it is warmed (or deliberately empty).
    pub async fn klines(&self, symbol: &str, interval: &str) -> Option<Arc<KlineSnapshot>> {
        let key = InstrumentKey::new(self.class, symbol, interval);
        let stream = Self::touch(&self.klines, &key, &self.deps);
        stream.get().await
    }

    /// Depth snapshot for `symbol`.
    pub async fn depth(&self, symbol: &str) -> Option<Arc<DepthSnapshot>> {
        let key = InstrumentKey::new(self.class, symbol, "");
        let stream = Self::touch(&self.depth, &key, &self.deps);
        stream.get().await
    }

    /// 24h ticker for `symbol`.
    pub async fn ticker(&self, symbol: &str) -> Option<Arc<Ticker24h>> {
        let key = InstrumentKey::new(self.class, symbol, "");
        let stream = Self::touch(&self.ticker, &key, &self.deps);
        stream.get().await
    }

    /// Latest exchange-info body, blocking until the first fetch landed.
    pub async fn exchange_info(&self) -> Option<Arc<Vec<u8>>> {
        self.exchange_info.get().await
    }

    /// Number of live streams, for the status endpoint.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.klines.len() + self.depth.len() + self.ticker.len()
    }

    fn touch<K: StreamKind>(
        map: &DashMap<InstrumentKey, StreamEntry<K>>,
        key: &InstrumentKey,
        deps: &StreamDeps,
    ) -> Arc<InstrumentStream<K>> {
        let mut entry = map.entry(key.clone()).or_insert_with(|| {
            debug!("{key} {} stream created", K::LABEL);
            StreamEntry {
                stream: InstrumentStream::new(key.clone(), deps.clone()),
                last_access: Instant::now(),
            }
        });
        entry.last_access = Instant::now();
        let stream = Arc::clone(&entry.stream);
        drop(entry);
        stream.start();
        stream
    }

    async fn sweep_loop(registry: Arc<Self>) {
        let mut stop = registry.stop_tx.subscribe();
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => registry.sweep_expired(),
                _ = stop.wait_for(|s| *s) => return,
            }
        }
    }

    fn sweep_expired(&self) {
        Self::sweep(&self.klines, kline_idle_expiry);
        Self::sweep(&self.depth, |_| DEFAULT_IDLE_EXPIRY);
        Self::sweep(&self.ticker, |_| DEFAULT_IDLE_EXPIRY);
    }

    fn sweep<K: StreamKind>(
        map: &DashMap<InstrumentKey, StreamEntry<K>>,
        expiry: impl Fn(&InstrumentKey) -> Duration,
    ) {
        let now = Instant::now();
        let expired: Vec<InstrumentKey> = map
            .iter()
            .filter(|entry| now.duration_since(entry.last_access) > expiry(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for key in expired {
            // Re-check under the removal lock: a request may have touched
            // the entry between the scan and now.
            let removed =
                map.remove_if(&key, |k, entry| now.duration_since(entry.last_access) > expiry(k));
            if let Some((key, entry)) = removed {
                entry.stream.stop();
                debug!(
                    "{key} {} websocket closed after being idle for {}s",
                    K::LABEL,
                    expiry(&key).as_secs()
                );
            }
        }
    }

    /// Stop the sweeper, the poller, and every stream; wait for their
    /// supervisors within a bounded grace period.
    pub async fn shutdown(&self) {
        info!("{} service shutting down", self.class);
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.exchange_info.stop();

        let klines = Self::drain(&self.klines);
        let depth = Self::drain(&self.depth);
        let ticker = Self::drain(&self.ticker);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for stream in &klines {
            stream.join(deadline.saturating_duration_since(Instant::now())).await;
        }
        for stream in &depth {
            stream.join(deadline.saturating_duration_since(Instant::now())).await;
        }
        for stream in &ticker {
            stream.join(deadline.saturating_duration_since(Instant::now())).await;
        }
        self.exchange_info
            .join(deadline.saturating_duration_since(Instant::now()))
            .await;
        info!("{} service shutdown complete", self.class);
    }

    fn drain<K: StreamKind>(
        map: &DashMap<InstrumentKey, StreamEntry<K>>,
    ) -> Vec<Arc<InstrumentStream<K>>> {
        let streams: Vec<_> = map
            .iter()
            .map(|entry| Arc::clone(&entry.stream))
            .collect();
        map.clear();
        for stream in &streams {
            stream.stop();
        }
        streams
    }
}

/// Kline streams idle out after twice their bucket duration.
fn kline_idle_expiry(key: &InstrumentKey) -> Duration {
    interval_duration(&key.interval)
        .map(|d| d * 2)
        .unwrap_or(DEFAULT_IDLE_EXPIRY)
}
