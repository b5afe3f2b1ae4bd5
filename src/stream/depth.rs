//! Order-book top-of-book cache.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use crate::fetch::FetchError;
use crate::market::InstrumentKey;
use crate::stream::{StreamDeps, StreamKind};

/// Maximum book levels kept per side.
pub const DEPTH_LEVELS: usize = 20;

/// Top-of-book snapshot mirrored from the partial depth stream. Prices
/// and quantities stay upstream strings; bids are sorted descending and
/// asks ascending, as delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepthSnapshot {
    pub last_update_id: i64,
    pub event_time: i64,
    pub transaction_time: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Wire frame of `<symbol>@depth20@100ms`. Spot sends bare
/// `{lastUpdateId, bids, asks}`; futures wraps the sides in `b`/`a` with
/// event and transaction times.
#[derive(Debug, Deserialize)]
struct DepthFrame {
    #[serde(rename = "lastUpdateId", default)]
    last_update_id: i64,
    #[serde(rename = "u", default)]
    final_update_id: i64,
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "T", default)]
    transaction_time: i64,
    #[serde(default)]
    bids: Vec<[String; 2]>,
    #[serde(default)]
    asks: Vec<[String; 2]>,
    #[serde(rename = "b", default)]
    b: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    a: Vec<[String; 2]>,
}

impl From<DepthFrame> for DepthSnapshot {
    fn from(frame: DepthFrame) -> Self {
        let mut bids = if frame.bids.is_empty() { frame.b } else { frame.bids };
        let mut asks = if frame.asks.is_empty() { frame.a } else { frame.asks };
        bids.truncate(DEPTH_LEVELS);
        asks.truncate(DEPTH_LEVELS);
        Self {
            last_update_id: if frame.last_update_id != 0 {
                frame.last_update_id
            } else {
                frame.final_update_id
            },
            event_time: frame.event_time,
            transaction_time: frame.transaction_time,
            bids,
            asks,
        }
    }
}

/// Depth stream strategy: no REST bootstrap, every frame is a complete
/// top-N snapshot swapped in atomically.
pub struct DepthStream;

#[async_trait]
impl StreamKind for DepthStream {
    type State = ();
    type Snapshot = DepthSnapshot;
    const LABEL: &'static str = "depth";

    fn stream_url(key: &InstrumentKey) -> String {
        format!(
            "{}/ws/{}@depth20@100ms",
            key.class.ws_base(),
            key.symbol_lower()
        )
    }

    async fn bootstrap(_key: &InstrumentKey, _deps: &StreamDeps) -> Result<(), FetchError> {
        Ok(())
    }

    fn merge(_state: &mut (), frame: &str, key: &InstrumentKey) -> Option<DepthSnapshot> {
        let frame: DepthFrame = match serde_json::from_str(frame) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("{key} depth frame ignored: {e}");
                return None;
            }
        };
        Some(DepthSnapshot::from(frame))
    }

    fn empty() -> DepthSnapshot {
        DepthSnapshot::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketClass;

    #[test]
    fn spot_frame_maps_directly() {
        let frame = r#"{
            "lastUpdateId": 160,
            "bids": [["0.0024","10"],["0.0023","5"]],
            "asks": [["0.0026","100"],["0.0027","12"]]
        }"#;
        let key = InstrumentKey::new(MarketClass::Spot, "BNBUSDT", "");
        let snap = DepthStream::merge(&mut (), frame, &key).unwrap();
        assert_eq!(snap.last_update_id, 160);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0], ["0.0024".to_string(), "10".to_string()]);
        assert_eq!(snap.asks[1], ["0.0027".to_string(), "12".to_string()]);
    }

    #[test]
    fn futures_frame_uses_short_keys() {
        let frame = r#"{
            "e":"depthUpdate","E":1700000000100,"T":1700000000095,
            "s":"BTCUSDT","U":100,"u":200,"pu":99,
            "b":[["42000.10","1.5"],["42000.00","2.0"]],
            "a":[["42000.20","0.7"]]
        }"#;
        let key = InstrumentKey::new(MarketClass::Futures, "BTCUSDT", "");
        let snap = DepthStream::merge(&mut (), frame, &key).unwrap();
        assert_eq!(snap.last_update_id, 200);
        assert_eq!(snap.event_time, 1_700_000_000_100);
        assert_eq!(snap.transaction_time, 1_700_000_000_095);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.asks.len(), 1);
    }

    #[test]
    fn sides_are_truncated_to_twenty_levels() {
        let levels: Vec<String> = (0..30)
            .map(|i| format!(r#"["{}.0","1"]"#, 100 - i))
            .collect();
        let frame = format!(
            r#"{{"lastUpdateId":1,"bids":[{}],"asks":[{}]}}"#,
            levels.join(","),
            levels.join(","),
        );
        let key = InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "");
        let snap = DepthStream::merge(&mut (), &frame, &key).unwrap();
        assert_eq!(snap.bids.len(), DEPTH_LEVELS);
        assert_eq!(snap.asks.len(), DEPTH_LEVELS);
    }

    #[test]
    fn ordering_is_preserved_verbatim() {
        let frame = r#"{
            "lastUpdateId": 7,
            "bids": [["101.0","1"],["100.5","2"],["100.0","3"]],
            "asks": [["101.5","1"],["102.0","2"],["102.5","3"]]
        }"#;
        let key = InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "");
        let snap = DepthStream::merge(&mut (), frame, &key).unwrap();
        let bid_prices: Vec<f64> = snap.bids.iter().map(|l| l[0].parse().unwrap()).collect();
        let ask_prices: Vec<f64> = snap.asks.iter().map(|l| l[0].parse().unwrap()).collect();
        assert!(bid_prices.windows(2).all(|w| w[0] > w[1]));
        assert!(ask_prices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stream_url_shape() {
        let key = InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "");
        assert_eq!(
            DepthStream::stream_url(&key),
            "wss://stream.binance.com:9443/ws/btcusdt@depth20@100ms"
        );
    }
}
