//! Live per-instrument caches fed by upstream WebSocket streams.
//!
//! One [`InstrumentStream`] owns one upstream subscription: a supervisor
//! task that bootstraps over REST where the kind calls for it, keeps the
//! WebSocket alive with ping/pong and reconnect backoff, folds every frame
//! into its working state, and publishes immutable snapshots for readers.

pub mod depth;
pub mod klines;
pub mod ticker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::backoff::DelayIterator;
use crate::fetch::FetchError;
use crate::market::InstrumentKey;
use crate::quota::QuotaController;
use crate::rate_limit::RateLimiter;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How often a parked stream re-checks the ban state.
const RECOVERY_POLL: Duration = Duration::from_secs(5);

/// Handles every stream needs to reach upstream. Cheap to clone.
#[derive(Clone)]
pub struct StreamDeps {
    pub quota: Arc<QuotaController>,
    pub limiter: Arc<RateLimiter>,
    pub http: reqwest::Client,
}

/// Strategy for one cached stream kind: where to subscribe, how to
/// bootstrap, and how to fold upstream frames into snapshots.
#[async_trait]
pub trait StreamKind: Send + Sync + Sized + 'static {
    /// Working state owned by the supervisor task.
    type State: Default + Send + 'static;

    /// Published snapshot readers receive.
    type Snapshot: Send + Sync + 'static;

    /// Log label, e.g. `"kline"`.
    const LABEL: &'static str;

    /// Full WebSocket URL for the subscription.
    fn stream_url(key: &InstrumentKey) -> String;

    /// Initial REST fill; kinds without a bootstrap return a default state.
    async fn bootstrap(key: &InstrumentKey, deps: &StreamDeps)
        -> Result<Self::State, FetchError>;

    /// Fold one upstream frame into the state; `Some` publishes a snapshot.
    fn merge(state: &mut Self::State, frame: &str, key: &InstrumentKey) -> Option<Self::Snapshot>;

    /// Snapshot deliberately served while the class is banned.
    fn empty() -> Self::Snapshot;
}

enum ReadExit {
    Cancelled,
    Disconnected,
}

/// One live cache for one `(class, symbol, interval)` subscription.
pub struct InstrumentStream<K: StreamKind> {
    key: InstrumentKey,
    deps: StreamDeps,
    snapshot: RwLock<Option<Arc<K::Snapshot>>>,
    ready_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    reconnects: AtomicU64,
}

impl<K: StreamKind> InstrumentStream<K> {
    #[must_use]
    pub fn new(key: InstrumentKey, deps: StreamDeps) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            key,
            deps,
            snapshot: RwLock::new(None),
            ready_tx,
            stop_tx,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
            reconnects: AtomicU64::new(0),
        })
    }

    /// Spawn the supervisor. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let stream = Arc::clone(self);
        let handle = tokio::spawn(stream.supervise());
        *self.task.lock() = Some(handle);
    }

    /// Signal the supervisor to stop. Readers keep the last snapshot.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Await supervisor exit, bounded by `grace`.
    pub async fn join(&self, grace: Duration) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(
                    "{} {} supervisor did not exit within {grace:?}",
                    self.key,
                    K::LABEL
                );
            }
        }
    }

    /// Block until the stream has published at least once (or decided to
    /// serve empty), then return the current snapshot.
    pub async fn get(&self) -> Option<Arc<K::Snapshot>> {
        let mut ready = self.ready_tx.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
        self.snapshot.read().clone()
    }

    fn publish(&self, snapshot: K::Snapshot) {
        *self.snapshot.write() = Some(Arc::new(snapshot));
        self.ready_tx.send_replace(true);
    }

    async fn supervise(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut retry = DelayIterator::new();

        'outer: loop {
            if *stop.borrow() {
                break;
            }

            // A banned class gets a deliberate empty snapshot; the stream
            // parks without dialing out until the ban lifts.
            if self.deps.quota.is_banned(self.key.class) {
                debug!(
                    "{} {} initialization skipped during API ban",
                    self.key,
                    K::LABEL
                );
                self.publish(K::empty());
                if !self.wait_for_recovery(&mut stop).await {
                    break;
                }
                retry.reset();
                continue;
            }

            let bootstrap_outcome = tokio::select! {
                outcome = self.bootstrap_with_retry() => Some(outcome),
                _ = stop.wait_for(|s| *s) => None,
            };
            let state = match bootstrap_outcome {
                Some(Some(state)) => state,
                Some(None) => {
                    self.publish(K::empty());
                    if !self.wait_for_recovery(&mut stop).await {
                        break;
                    }
                    retry.reset();
                    continue;
                }
                None => break,
            };

            let url = K::stream_url(&self.key);
            let connected = tokio::select! {
                conn = connect_async(url.as_str()) => conn,
                _ = stop.wait_for(|s| *s) => break,
            };
            let ws = match connected {
                Ok((ws, _)) => ws,
                Err(e) => {
                    error!("{} {} websocket connection error: {e}", self.key, K::LABEL);
                    self.deps
                        .quota
                        .check_response(self.key.class, None, Some(&e.to_string()));
                    tokio::select! {
                        () = retry.delay() => continue 'outer,
                        _ = stop.wait_for(|s| *s) => break,
                    }
                }
            };
            debug!("{} {} websocket connected", self.key, K::LABEL);
            retry.reset();

            match self.read_loop(ws, state, &mut stop).await {
                ReadExit::Cancelled => break,
                ReadExit::Disconnected => {
                    let attempt = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::counter!("market_proxy_ws_reconnects_total").increment(1);
                    warn!(
                        "{} {} websocket disconnected, trying to reconnect (attempt {attempt})",
                        self.key,
                        K::LABEL
                    );
                    tokio::select! {
                        () = retry.delay() => {}
                        _ = stop.wait_for(|s| *s) => break,
                    }
                }
            }
        }

        // Unblock any reader still waiting on the first snapshot.
        self.ready_tx.send_replace(true);
        debug!("{} {} stream stopped", self.key, K::LABEL);
    }

    /// Park while the class is banned. Returns `false` when stopped.
    async fn wait_for_recovery(&self, stop: &mut watch::Receiver<bool>) -> bool {
        while self.deps.quota.is_banned(self.key.class) {
            tokio::select! {
                () = tokio::time::sleep(RECOVERY_POLL) => {}
                _ = stop.wait_for(|s| *s) => return false,
            }
        }
        debug!("{} {} resuming after ban recovery", self.key, K::LABEL);
        true
    }

    async fn bootstrap_with_retry(&self) -> Option<K::State> {
        let mut retry = DelayIterator::new();
        loop {
            if self.deps.quota.is_banned(self.key.class) {
                debug!("{} {} bootstrap aborted during API ban", self.key, K::LABEL);
                return None;
            }
            match K::bootstrap(&self.key, &self.deps).await {
                Ok(state) => return Some(state),
                Err(FetchError::Banned) => {
                    debug!(
                        "{} {} bootstrap stopped by detected ban",
                        self.key,
                        K::LABEL
                    );
                    return None;
                }
                Err(e) => {
                    error!("{} {} bootstrap via REST failed: {e}", self.key, K::LABEL);
                    retry.delay().await;
                }
            }
        }
    }

    async fn read_loop(
        &self,
        ws: Ws,
        mut state: K::State,
        stop: &mut watch::Receiver<bool>,
    ) -> ReadExit {
        let (mut write, mut read) = ws.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_pong = Instant::now();

        enum ReadEvent {
            Stop,
            Ping,
            Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
        }

        loop {
            let event = tokio::select! {
                _ = stop.wait_for(|s| *s) => ReadEvent::Stop,
                _ = ping.tick() => ReadEvent::Ping,
                frame = read.next() => ReadEvent::Frame(frame),
            };

            match event {
                ReadEvent::Stop => {
                    let _ = write.send(Message::Close(None)).await;
                    return ReadExit::Cancelled;
                }
                ReadEvent::Ping => {
                    if last_pong.elapsed() > PONG_TIMEOUT {
                        warn!("{} {} websocket pong timeout", self.key, K::LABEL);
                        return ReadExit::Disconnected;
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return ReadExit::Disconnected;
                    }
                }
                ReadEvent::Frame(frame) => match frame {
                    Some(Ok(Message::Text(text))) => {
                        metrics::counter!("market_proxy_ws_messages_total").increment(1);
                        if let Some(snapshot) = K::merge(&mut state, &text, &self.key) {
                            self.publish(snapshot);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return ReadExit::Disconnected;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("{} {} websocket closed by upstream", self.key, K::LABEL);
                        return ReadExit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("{} {} websocket read error: {e}", self.key, K::LABEL);
                        return ReadExit::Disconnected;
                    }
                },
            }
        }
    }
}
