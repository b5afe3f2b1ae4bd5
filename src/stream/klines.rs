//! Kline (candlestick) window cache.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::fetch::{fetch_bytes, FetchError};
use crate::market::InstrumentKey;
use crate::stream::{StreamDeps, StreamKind};

/// Maximum number of candles retained per stream.
pub const KLINE_WINDOW: usize = 1000;

/// One OHLCV bucket; decimal fields are kept verbatim as upstream strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kline {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_volume: String,
    pub trade_count: i64,
    pub taker_buy_base: String,
    pub taker_buy_quote: String,
}

/// Published snapshot: the window contents, oldest first.
pub type KlineSnapshot = Vec<Arc<Kline>>;

/// Rolling candle window. Updates append newer buckets, replace the
/// newest bucket in place, and drop anything older; length stays within
/// [`KLINE_WINDOW`] by evicting from the front.
#[derive(Debug, Default)]
pub struct KlineWindow {
    rows: VecDeque<Arc<Kline>>,
}

impl KlineWindow {
    /// Build a window from bootstrap rows, applying the merge rules.
    #[must_use]
    pub fn from_rows<I: IntoIterator<Item = Kline>>(rows: I) -> Self {
        let mut window = Self::default();
        for kline in rows {
            window.merge(kline);
        }
        window
    }

    /// Fold one update into the window.
    pub fn merge(&mut self, kline: Kline) {
        match self.rows.back() {
            Some(last) if last.open_time < kline.open_time => {
                self.rows.push_back(Arc::new(kline));
                while self.rows.len() > KLINE_WINDOW {
                    self.rows.pop_front();
                }
            }
            Some(last) if last.open_time == kline.open_time => {
                if let Some(slot) = self.rows.back_mut() {
                    *slot = Arc::new(kline);
                }
            }
            Some(_) => {} // older than the newest bucket: stale, drop
            None => self.rows.push_back(Arc::new(kline)),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> KlineSnapshot {
        self.rows.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// REST kline row: `[open_time, o, h, l, c, v, close_time, q, n, V, Q, ignore]`.
#[derive(Debug, Deserialize)]
struct RestKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
    String,
    String,
    serde_json::Value,
);

impl From<RestKline> for Kline {
    fn from(row: RestKline) -> Self {
        Self {
            open_time: row.0,
            open: row.1,
            high: row.2,
            low: row.3,
            close: row.4,
            volume: row.5,
            close_time: row.6,
            quote_volume: row.7,
            trade_count: row.8,
            taker_buy_base: row.9,
            taker_buy_quote: row.10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trade_count: i64,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "V")]
    taker_buy_base: String,
    #[serde(rename = "Q")]
    taker_buy_quote: String,
}

impl From<KlinePayload> for Kline {
    fn from(payload: KlinePayload) -> Self {
        Self {
            open_time: payload.open_time,
            open: payload.open,
            high: payload.high,
            low: payload.low,
            close: payload.close,
            volume: payload.volume,
            close_time: payload.close_time,
            quote_volume: payload.quote_volume,
            trade_count: payload.trade_count,
            taker_buy_base: payload.taker_buy_base,
            taker_buy_quote: payload.taker_buy_quote,
        }
    }
}

/// Kline stream strategy: REST backfill of the last 1000 candles, then a
/// `<symbol>@kline_<interval>` subscription.
pub struct KlineStream;

#[async_trait]
impl StreamKind for KlineStream {
    type State = KlineWindow;
    type Snapshot = KlineSnapshot;
    const LABEL: &'static str = "kline";

    fn stream_url(key: &InstrumentKey) -> String {
        format!(
            "{}/ws/{}@kline_{}",
            key.class.ws_base(),
            key.symbol_lower(),
            key.interval
        )
    }

    async fn bootstrap(key: &InstrumentKey, deps: &StreamDeps) -> Result<KlineWindow, FetchError> {
        debug!("{key} kline initialization through REST");
        let body = fetch_bytes(
            &deps.http,
            &deps.quota,
            &deps.limiter,
            key.class,
            key.class.klines_path(),
            &[
                ("symbol", key.symbol.as_str()),
                ("interval", key.interval.as_str()),
                ("limit", "1000"),
            ],
        )
        .await?;
        let rows: Vec<RestKline> = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Transient(anyhow::anyhow!("kline decode failed: {e}")))?;
        Ok(KlineWindow::from_rows(rows.into_iter().map(Kline::from)))
    }

    fn merge(state: &mut KlineWindow, frame: &str, key: &InstrumentKey) -> Option<KlineSnapshot> {
        let event: KlineEvent = match serde_json::from_str(frame) {
            Ok(event) => event,
            Err(e) => {
                trace!("{key} kline frame ignored: {e}");
                return None;
            }
        };
        let kline = Kline::from(event.kline);
        trace!(
            "{key} kline message received for open timestamp {}",
            kline.open_time
        );
        state.merge(kline);
        Some(state.snapshot())
    }

    fn empty() -> KlineSnapshot {
        Vec::new()
    }
}
