//! 24h ticker cache with fast best-bid/ask overlay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::fetch::FetchError;
use crate::market::InstrumentKey;
use crate::stream::{StreamDeps, StreamKind};

/// Mirror of the exchange's single-symbol 24h statistics object, with the
/// best bid/ask kept current from the bookTicker stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    pub price_change: String,
    pub price_change_percent: String,
    pub weighted_avg_price: String,
    pub prev_close_price: String,
    pub last_price: String,
    pub last_qty: String,
    pub bid_price: String,
    pub bid_qty: String,
    pub ask_price: String,
    pub ask_qty: String,
    pub open_price: String,
    pub high_price: String,
    pub low_price: String,
    pub volume: String,
    pub quote_volume: String,
    pub open_time: i64,
    pub close_time: i64,
    pub first_id: i64,
    pub last_id: i64,
    pub count: i64,
}

/// Envelope of a combined-stream frame.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    stream: String,
    data: serde_json::Value,
}

/// `<symbol>@ticker` event payload.
#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price_change: String,
    #[serde(rename = "P")]
    price_change_percent: String,
    #[serde(rename = "w", default)]
    weighted_avg_price: String,
    #[serde(rename = "x", default)]
    prev_close_price: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "Q", default)]
    last_qty: String,
    #[serde(rename = "b", default)]
    bid_price: String,
    #[serde(rename = "B", default)]
    bid_qty: String,
    #[serde(rename = "a", default)]
    ask_price: String,
    #[serde(rename = "A", default)]
    ask_qty: String,
    #[serde(rename = "o")]
    open_price: String,
    #[serde(rename = "h")]
    high_price: String,
    #[serde(rename = "l")]
    low_price: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "O")]
    open_time: i64,
    #[serde(rename = "C")]
    close_time: i64,
    #[serde(rename = "F")]
    first_id: i64,
    #[serde(rename = "L")]
    last_id: i64,
    #[serde(rename = "n")]
    count: i64,
}

impl From<TickerEvent> for Ticker24h {
    fn from(event: TickerEvent) -> Self {
        Self {
            symbol: event.symbol,
            price_change: event.price_change,
            price_change_percent: event.price_change_percent,
            weighted_avg_price: event.weighted_avg_price,
            prev_close_price: event.prev_close_price,
            last_price: event.last_price,
            last_qty: event.last_qty,
            bid_price: event.bid_price,
            bid_qty: event.bid_qty,
            ask_price: event.ask_price,
            ask_qty: event.ask_qty,
            open_price: event.open_price,
            high_price: event.high_price,
            low_price: event.low_price,
            volume: event.volume,
            quote_volume: event.quote_volume,
            open_time: event.open_time,
            close_time: event.close_time,
            first_id: event.first_id,
            last_id: event.last_id,
            count: event.count,
        }
    }
}

/// `<symbol>@bookTicker` event payload. Carries only the best bid/ask.
#[derive(Debug, Clone, Deserialize)]
struct BookTickerEvent {
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "B")]
    bid_qty: String,
    #[serde(rename = "a")]
    ask_price: String,
    #[serde(rename = "A")]
    ask_qty: String,
}

/// Working state: the latest full ticker plus the latest book overlay.
#[derive(Debug, Default)]
pub struct TickerState {
    ticker: Option<Ticker24h>,
    book: Option<BookTickerEvent>,
}

impl TickerState {
    fn merged(&self) -> Option<Ticker24h> {
        let mut ticker = self.ticker.clone()?;
        if let Some(book) = &self.book {
            ticker.bid_price = book.bid_price.clone();
            ticker.bid_qty = book.bid_qty.clone();
            ticker.ask_price = book.ask_price.clone();
            ticker.ask_qty = book.ask_qty.clone();
        }
        Some(ticker)
    }
}

/// Ticker stream strategy: combined `@ticker` + `@bookTicker`
/// subscription, no REST bootstrap.
pub struct TickerStream;

#[async_trait]
impl StreamKind for TickerStream {
    type State = TickerState;
    type Snapshot = Ticker24h;
    const LABEL: &'static str = "ticker24hr";

    fn stream_url(key: &InstrumentKey) -> String {
        let symbol = key.symbol_lower();
        format!(
            "{}/stream?streams={symbol}@ticker/{symbol}@bookTicker",
            key.class.ws_base()
        )
    }

    async fn bootstrap(_key: &InstrumentKey, _deps: &StreamDeps) -> Result<TickerState, FetchError> {
        Ok(TickerState::default())
    }

    fn merge(state: &mut TickerState, frame: &str, key: &InstrumentKey) -> Option<Ticker24h> {
        let envelope: StreamFrame = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!("{key} ticker frame ignored: {e}");
                return None;
            }
        };

        if envelope.stream.ends_with("@bookTicker") {
            let book: BookTickerEvent = serde_json::from_value(envelope.data).ok()?;
            state.book = Some(book);
        } else if envelope.stream.ends_with("@ticker") {
            let event: TickerEvent = serde_json::from_value(envelope.data).ok()?;
            state.ticker = Some(Ticker24h::from(event));
        } else {
            return None;
        }

        state.merged()
    }

    fn empty() -> Ticker24h {
        Ticker24h::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketClass;

    const TICKER_FRAME: &str = r#"{
        "stream": "btcusdt@ticker",
        "data": {
            "e":"24hrTicker","E":1700000000000,"s":"BTCUSDT",
            "p":"100.00","P":"0.24","w":"42010.5","x":"41900.00",
            "c":"42000.00","Q":"0.5","b":"41999.00","B":"2.0",
            "a":"42001.00","A":"1.5","o":"41900.00","h":"42100.00",
            "l":"41800.00","v":"1000.0","q":"42000000.0",
            "O":1699913600000,"C":1700000000000,"F":1,"L":999,"n":999
        }
    }"#;

    const BOOK_FRAME: &str = r#"{
        "stream": "btcusdt@bookTicker",
        "data": {"u":12345,"s":"BTCUSDT","b":"41999.50","B":"3.1","a":"42000.50","A":"0.9"}
    }"#;

    fn key() -> InstrumentKey {
        InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "")
    }

    #[test]
    fn ticker_event_builds_snapshot() {
        let mut state = TickerState::default();
        let snap = TickerStream::merge(&mut state, TICKER_FRAME, &key()).unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.last_price, "42000.00");
        assert_eq!(snap.bid_price, "41999.00");
        assert_eq!(snap.count, 999);
    }

    #[test]
    fn book_ticker_overlays_best_bid_ask() {
        let mut state = TickerState::default();
        TickerStream::merge(&mut state, TICKER_FRAME, &key()).unwrap();
        let snap = TickerStream::merge(&mut state, BOOK_FRAME, &key()).unwrap();
        assert_eq!(snap.bid_price, "41999.50");
        assert_eq!(snap.bid_qty, "3.1");
        assert_eq!(snap.ask_price, "42000.50");
        assert_eq!(snap.ask_qty, "0.9");
        // The slower ticker fields stay from the @ticker event.
        assert_eq!(snap.last_price, "42000.00");
        assert_eq!(snap.volume, "1000.0");
    }

    #[test]
    fn book_ticker_alone_publishes_nothing() {
        let mut state = TickerState::default();
        assert!(TickerStream::merge(&mut state, BOOK_FRAME, &key()).is_none());
        // Once the ticker arrives, the stored overlay applies immediately.
        let snap = TickerStream::merge(&mut state, TICKER_FRAME, &key()).unwrap();
        assert_eq!(snap.bid_price, "41999.50");
    }

    #[test]
    fn serialization_uses_exchange_field_names() {
        let mut state = TickerState::default();
        let snap = TickerStream::merge(&mut state, TICKER_FRAME, &key()).unwrap();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["priceChangePercent"], "0.24");
        assert_eq!(json["lastPrice"], "42000.00");
        assert_eq!(json["bidPrice"], "41999.00");
        assert_eq!(json["openTime"], 1_699_913_600_000_i64);
    }

    #[test]
    fn stream_url_combines_both_topics() {
        assert_eq!(
            TickerStream::stream_url(&key()),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@ticker/btcusdt@bookTicker"
        );
    }
}
