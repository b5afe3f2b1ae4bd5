//! Market classes and instrument identity.

use std::fmt;
use std::time::Duration;

/// Upstream market class served by one proxy listener.
///
/// The class selects base URLs, URL path families and the default
/// per-minute request weight budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketClass {
    Spot,
    Futures,
}

impl MarketClass {
    /// Both classes, in listener order.
    pub const ALL: [MarketClass; 2] = [MarketClass::Spot, MarketClass::Futures];

    /// REST base URL.
    #[must_use]
    pub fn rest_base(self) -> &'static str {
        match self {
            MarketClass::Spot => "https://api.binance.com",
            MarketClass::Futures => "https://fapi.binance.com",
        }
    }

    /// WebSocket base URL (without the `/ws/<stream>` suffix).
    #[must_use]
    pub fn ws_base(self) -> &'static str {
        match self {
            MarketClass::Spot => "wss://stream.binance.com:9443",
            MarketClass::Futures => "wss://fstream.binance.com",
        }
    }

    /// Klines endpoint path for this class.
    #[must_use]
    pub fn klines_path(self) -> &'static str {
        match self {
            MarketClass::Spot => "/api/v3/klines",
            MarketClass::Futures => "/fapi/v1/klines",
        }
    }

    /// Exchange-info endpoint path for this class.
    #[must_use]
    pub fn exchange_info_path(self) -> &'static str {
        match self {
            MarketClass::Spot => "/api/v3/exchangeInfo",
            MarketClass::Futures => "/fapi/v1/exchangeInfo",
        }
    }

    /// Default request-weight budget per minute, per the exchange docs.
    #[must_use]
    pub fn default_weight_limit(self) -> u32 {
        match self {
            MarketClass::Spot => 1200,
            MarketClass::Futures => 2400,
        }
    }
}

impl fmt::Display for MarketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketClass::Spot => write!(f, "SPOT"),
            MarketClass::Futures => write!(f, "FUTURES"),
        }
    }
}

/// Identity of one cached upstream subscription.
///
/// `interval` is empty for depth and ticker streams, non-empty for klines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentKey {
    pub class: MarketClass,
    pub symbol: String,
    pub interval: String,
}

impl InstrumentKey {
    /// Build a key; the symbol is kept exactly as the client sent it.
    #[must_use]
    pub fn new(class: MarketClass, symbol: &str, interval: &str) -> Self {
        Self {
            class,
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        }
    }

    /// Lowercased symbol, as stream names require.
    #[must_use]
    pub fn symbol_lower(&self) -> String {
        self.symbol.to_lowercase()
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interval.is_empty() {
            write!(f, "{} {}", self.class, self.symbol)
        } else {
            write!(f, "{} {}@{}", self.class, self.symbol, self.interval)
        }
    }
}

/// Bucket duration of a kline interval, `None` for unrecognized intervals.
#[must_use]
pub fn interval_duration(interval: &str) -> Option<Duration> {
    let secs = match interval {
        "1s" => 1,
        "1m" => 60,
        "3m" => 3 * 60,
        "5m" => 5 * 60,
        "15m" => 15 * 60,
        "30m" => 30 * 60,
        "1h" => 60 * 60,
        "2h" => 2 * 60 * 60,
        "4h" => 4 * 60 * 60,
        "6h" => 6 * 60 * 60,
        "8h" => 8 * 60 * 60,
        "12h" => 12 * 60 * 60,
        "1d" => 24 * 60 * 60,
        "3d" => 3 * 24 * 60 * 60,
        "1w" => 7 * 24 * 60 * 60,
        "1M" => 30 * 24 * 60 * 60,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_interval_when_present() {
        let key = InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "1m");
        assert_eq!(key.to_string(), "SPOT BTCUSDT@1m");

        let key = InstrumentKey::new(MarketClass::Futures, "ETHUSDT", "");
        assert_eq!(key.to_string(), "FUTURES ETHUSDT");
    }

    #[test]
    fn keys_are_value_equal() {
        let a = InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "5m");
        let b = InstrumentKey::new(MarketClass::Spot, "BTCUSDT", "5m");
        let c = InstrumentKey::new(MarketClass::Futures, "BTCUSDT", "5m");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn interval_table() {
        assert_eq!(interval_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(interval_duration("4h"), Some(Duration::from_secs(14_400)));
        assert_eq!(interval_duration("1w"), Some(Duration::from_secs(604_800)));
        assert_eq!(interval_duration("7q"), None);
    }
}
