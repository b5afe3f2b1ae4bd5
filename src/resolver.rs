//! Cache-or-forward routing and on-wire response assembly.
//!
//! Pure logic: given `(method, path, query)` decide which stream can answer
//! and with which parameters, and build response bodies that are bit-exact
//! with the exchange's public schema.

use http::Method;
use serde_json::{json, Value};

use crate::stream::depth::DepthSnapshot;
use crate::stream::klines::Kline;
use crate::util::QueryParams;

/// Klines `limit` when the client sends none.
const DEFAULT_KLINE_LIMIT: usize = 500;

/// Depth `limit` when the client sends none.
const DEFAULT_DEPTH_LIMIT: usize = 20;

/// How a request is to be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve from the kline stream cache.
    Klines {
        symbol: String,
        interval: String,
        limit: usize,
    },
    /// Serve from the depth stream cache.
    Depth { symbol: String, limit: usize },
    /// Serve from the ticker stream cache.
    Ticker { symbol: String },
    /// Serve the cached exchange-info body.
    ExchangeInfo,
    /// Hand over to the upstream forwarder.
    Forward,
}

/// Decide how to answer `(method, path, query)`.
#[must_use]
pub fn resolve(method: &Method, path: &str, query: &QueryParams) -> Route {
    if method != Method::GET {
        return Route::Forward;
    }

    match path {
        "/api/v3/klines" | "/fapi/v1/klines" => resolve_klines(query),
        "/api/v3/depth" | "/fapi/v1/depth" => resolve_depth(query),
        "/api/v3/ticker/24hr" => resolve_ticker(query),
        "/api/v3/exchangeInfo" | "/fapi/v1/exchangeInfo" => Route::ExchangeInfo,
        _ => Route::Forward,
    }
}

fn resolve_klines(query: &QueryParams) -> Route {
    let symbol = query.get("symbol").unwrap_or_default();
    let interval = query.get("interval").unwrap_or_default();
    let limit = match query.get("limit") {
        None => DEFAULT_KLINE_LIMIT,
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) => limit,
            Err(_) => return Route::Forward,
        },
    };

    if symbol.is_empty()
        || interval.is_empty()
        || limit == 0
        || limit > 1000
        || query.has("startTime")
        || query.has("endTime")
    {
        return Route::Forward;
    }

    Route::Klines {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        limit,
    }
}

fn resolve_depth(query: &QueryParams) -> Route {
    let symbol = query.get("symbol").unwrap_or_default();
    let limit = match query.get("limit") {
        None => DEFAULT_DEPTH_LIMIT,
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) => limit,
            Err(_) => return Route::Forward,
        },
    };

    if symbol.is_empty() || !(5..=20).contains(&limit) {
        return Route::Forward;
    }

    Route::Depth {
        symbol: symbol.to_string(),
        limit,
    }
}

fn resolve_ticker(query: &QueryParams) -> Route {
    match query.get("symbol") {
        Some(symbol) if !symbol.is_empty() => Route::Ticker {
            symbol: symbol.to_string(),
        },
        _ => Route::Forward,
    }
}

/// Serialize the trailing `limit` rows of a kline window, optionally
/// appending the synthetic next candle when the newest bucket has already
/// closed.
#[must_use]
pub fn kline_rows<K: AsRef<Kline>>(
    window: &[K],
    limit: usize,
    fake_candle: bool,
    now_ms: i64,
) -> Vec<Value> {
    let take = window.len().min(limit);
    let mut rows: Vec<Value> = window[window.len() - take..]
        .iter()
        .map(|k| kline_row(k.as_ref()))
        .collect();

    if fake_candle {
        if let Some(last) = window.last() {
            let last = last.as_ref();
            if now_ms > last.close_time {
                let fake = fake_kline_row(last);
                if rows.len() == limit {
                    if let Some(slot) = rows.last_mut() {
                        *slot = fake;
                    }
                } else {
                    rows.push(fake);
                }
            }
        }
    }

    rows
}

/// One kline as the exchange serializes it; the trailing `"0"` is a fixed
/// placeholder.
#[must_use]
pub fn kline_row(k: &Kline) -> Value {
    json!([
        k.open_time,
        k.open,
        k.high,
        k.low,
        k.close,
        k.volume,
        k.close_time,
        k.quote_volume,
        k.trade_count,
        k.taker_buy_base,
        k.taker_buy_quote,
        "0",
    ])
}

/// Project the not-yet-published current candle from the last closed one:
/// flat OHLC at the last close, zero volume and trades.
#[must_use]
pub fn fake_kline_row(last: &Kline) -> Value {
    let open_time = last.close_time + 1;
    let close_time = last.close_time + 1 + (last.close_time - last.open_time);
    json!([
        open_time,
        last.close,
        last.close,
        last.close,
        last.close,
        "0.0",
        close_time,
        "0.0",
        0,
        "0.0",
        "0.0",
        "0",
    ])
}

/// Depth body in the exchange's shape, both sides truncated to the same
/// `min(|bids|, |asks|, limit)` depth.
#[must_use]
pub fn depth_body(depth: &DepthSnapshot, limit: usize) -> Value {
    let take = depth.bids.len().min(depth.asks.len()).min(limit);
    json!({
        "lastUpdateId": depth.last_update_id,
        "E": depth.event_time,
        "T": depth.transaction_time,
        "bids": &depth.bids[..take],
        "asks": &depth.asks[..take],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn query(raw: &str) -> QueryParams {
        QueryParams::parse(Some(raw))
    }

    fn kline(open_time: i64, close_time: i64, close: &str) -> Arc<Kline> {
        Arc::new(Kline {
            open_time,
            open: "100".into(),
            high: "110".into(),
            low: "90".into(),
            close: close.into(),
            volume: "10".into(),
            close_time,
            quote_volume: "1000".into(),
            trade_count: 5,
            taker_buy_base: "4".into(),
            taker_buy_quote: "400".into(),
        })
    }

    #[rstest]
    // Scenario: plain kline request is served from the stream.
    #[case(
        "/api/v3/klines",
        "symbol=BTCUSDT&interval=1m&limit=500",
        Route::Klines { symbol: "BTCUSDT".into(), interval: "1m".into(), limit: 500 }
    )]
    #[case(
        "/fapi/v1/klines",
        "symbol=ETHUSDT&interval=5m",
        Route::Klines { symbol: "ETHUSDT".into(), interval: "5m".into(), limit: 500 }
    )]
    // Scenario: startTime forces a forward.
    #[case("/api/v3/klines", "symbol=BTCUSDT&interval=1m&startTime=1700000000000", Route::Forward)]
    #[case("/api/v3/klines", "symbol=BTCUSDT&interval=1m&endTime=1700000000000", Route::Forward)]
    #[case("/api/v3/klines", "symbol=BTCUSDT&interval=1m&limit=1001", Route::Forward)]
    #[case("/api/v3/klines", "symbol=BTCUSDT&interval=1m&limit=0", Route::Forward)]
    #[case("/api/v3/klines", "symbol=BTCUSDT&interval=1m&limit=abc", Route::Forward)]
    #[case("/api/v3/klines", "interval=1m", Route::Forward)]
    #[case("/api/v3/klines", "symbol=BTCUSDT", Route::Forward)]
    // Depth in and out of the cacheable range.
    #[case("/api/v3/depth", "symbol=BTCUSDT", Route::Depth { symbol: "BTCUSDT".into(), limit: 20 })]
    #[case("/api/v3/depth", "symbol=BTCUSDT&limit=5", Route::Depth { symbol: "BTCUSDT".into(), limit: 5 })]
    #[case("/api/v3/depth", "symbol=BTCUSDT&limit=100", Route::Forward)]
    #[case("/api/v3/depth", "symbol=BTCUSDT&limit=4", Route::Forward)]
    #[case("/fapi/v1/depth", "symbol=BTCUSDT&limit=10", Route::Depth { symbol: "BTCUSDT".into(), limit: 10 })]
    #[case("/api/v3/depth", "limit=10", Route::Forward)]
    // Ticker needs a symbol.
    #[case("/api/v3/ticker/24hr", "symbol=BTCUSDT", Route::Ticker { symbol: "BTCUSDT".into() })]
    #[case("/api/v3/ticker/24hr", "", Route::Forward)]
    // Exchange info always comes from the cache.
    #[case("/api/v3/exchangeInfo", "", Route::ExchangeInfo)]
    #[case("/fapi/v1/exchangeInfo", "", Route::ExchangeInfo)]
    // Anything else is passthrough.
    #[case("/api/v3/trades", "symbol=BTCUSDT", Route::Forward)]
    #[case("/api/v3/time", "", Route::Forward)]
    fn routing_table(#[case] path: &str, #[case] raw_query: &str, #[case] expected: Route) {
        assert_eq!(resolve(&Method::GET, path, &query(raw_query)), expected);
    }

    #[test]
    fn non_get_methods_are_forwarded() {
        let q = query("symbol=BTCUSDT&interval=1m");
        assert_eq!(resolve(&Method::POST, "/api/v3/klines", &q), Route::Forward);
        assert_eq!(resolve(&Method::DELETE, "/api/v3/depth", &q), Route::Forward);
    }

    #[test]
    fn rows_take_the_window_tail() {
        let window: Vec<Arc<Kline>> = (0..10)
            .map(|i| kline(i * 60_000, i * 60_000 + 59_999, "42"))
            .collect();
        let rows = kline_rows(&window, 3, false, 0);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], json!(7 * 60_000));
        assert_eq!(rows[2][0], json!(9 * 60_000));
    }

    #[test]
    fn row_shape_is_twelve_fields_with_placeholder() {
        let window = vec![kline(1000, 59_999, "42.5")];
        let rows = kline_rows(&window, 500, false, 0);
        let row = rows[0].as_array().unwrap();
        assert_eq!(row.len(), 12);
        assert_eq!(row[0], json!(1000));
        assert_eq!(row[4], json!("42.5"));
        assert_eq!(row[11], json!("0"));
    }

    #[test]
    fn fake_candle_appends_when_window_is_short() {
        // Scenario: last close_time 1700000059999, now 1700000120000.
        let window = vec![kline(1_700_000_000_000, 1_700_000_059_999, "42000.5")];
        let rows = kline_rows(&window, 500, true, 1_700_000_120_000);
        assert_eq!(rows.len(), 2);
        let fake = rows[1].as_array().unwrap();
        assert_eq!(fake[0], json!(1_700_000_060_000_i64));
        assert_eq!(fake[1], json!("42000.5"));
        assert_eq!(fake[2], json!("42000.5"));
        assert_eq!(fake[3], json!("42000.5"));
        assert_eq!(fake[4], json!("42000.5"));
        assert_eq!(fake[5], json!("0.0"));
        assert_eq!(fake[6], json!(1_700_000_119_999_i64));
        assert_eq!(fake[8], json!(0));
    }

    #[test]
    fn fake_candle_replaces_tail_at_limit() {
        let window: Vec<Arc<Kline>> = (0..5)
            .map(|i| kline(i * 60_000, i * 60_000 + 59_999, "42"))
            .collect();
        let rows = kline_rows(&window, 5, true, 10 * 60_000);
        assert_eq!(rows.len(), 5);
        // The trailing row is the projection, not the real fifth candle.
        assert_eq!(rows[4][0], json!(4 * 60_000 + 60_000));
        assert_eq!(rows[4][5], json!("0.0"));
    }

    #[test]
    fn fake_candle_skipped_while_bucket_is_open() {
        let window = vec![kline(1_700_000_000_000, 1_700_000_059_999, "42")];
        let rows = kline_rows(&window, 500, true, 1_700_000_030_000);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn fake_candle_disabled_by_flag() {
        let window = vec![kline(1_700_000_000_000, 1_700_000_059_999, "42")];
        let rows = kline_rows(&window, 500, false, 1_700_000_120_000);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn depth_body_truncates_symmetrically() {
        let depth = DepthSnapshot {
            last_update_id: 42,
            event_time: 1_700_000_000_000,
            transaction_time: 1_700_000_000_001,
            bids: (0..10)
                .map(|i| [format!("{}.0", 100 - i), "1".to_string()])
                .collect(),
            asks: (0..6)
                .map(|i| [format!("{}.0", 101 + i), "1".to_string()])
                .collect(),
        };
        let body = depth_body(&depth, 8);
        assert_eq!(body["lastUpdateId"], json!(42));
        assert_eq!(body["E"], json!(1_700_000_000_000_i64));
        assert_eq!(body["T"], json!(1_700_000_000_001_i64));
        // min(10 bids, 6 asks, limit 8) = 6 on both sides.
        assert_eq!(body["bids"].as_array().unwrap().len(), 6);
        assert_eq!(body["asks"].as_array().unwrap().len(), 6);
        assert_eq!(body["bids"][0], json!(["100.0", "1"]));
    }
}
