//! Client-side admission of outbound REST calls.
//!
//! Token bucket per market class, debited by the endpoint's documented
//! request weight so bursts from many clients are smoothed into the
//! exchange's per-minute budget.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use http::Method;
use tracing::warn;

use crate::market::MarketClass;
use crate::util::QueryParams;

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

// Safe constants for fallback values
const FALLBACK_RPS: NonZeroU32 = NonZeroU32::new(20).unwrap();
const FALLBACK_BURST: NonZeroU32 = NonZeroU32::new(1200).unwrap();

/// Token-bucket settings for one market class.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub rps: u32,
    pub burst: u32,
}

impl BucketConfig {
    fn quota(self) -> Quota {
        let rps = NonZeroU32::new(self.rps).unwrap_or(FALLBACK_RPS);
        let burst = NonZeroU32::new(self.burst).unwrap_or(FALLBACK_BURST);
        Quota::per_second(rps).allow_burst(burst)
    }
}

/// Weighted rate limiter shared by every outbound path of the proxy.
pub struct RateLimiter {
    spot: DirectLimiter,
    futures: DirectLimiter,
    spot_burst: u32,
    futures_burst: u32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(spot: BucketConfig, futures: BucketConfig) -> Self {
        Self {
            spot: GovernorLimiter::direct(spot.quota()),
            futures: GovernorLimiter::direct(futures.quota()),
            spot_burst: spot.burst.max(1),
            futures_burst: futures.burst.max(1),
        }
    }

    /// Block until the class's bucket can cover the request's weight.
    ///
    /// Never fails observably: an unsatisfiable weight is clamped to the
    /// bucket capacity, and cancellation is the caller dropping the future.
    pub async fn acquire(&self, class: MarketClass, method: &Method, path: &str, query: &QueryParams) {
        let weight = request_weight(method, path, query);
        let (limiter, burst) = match class {
            MarketClass::Spot => (&self.spot, self.spot_burst),
            MarketClass::Futures => (&self.futures, self.futures_burst),
        };
        if limiter.check().is_err() {
            metrics::counter!("market_proxy_rate_limit_waits_total").increment(1);
        }
        let clamped = weight.min(burst);
        if clamped < weight {
            warn!("request weight {weight} for {path} exceeds {class} burst capacity, clamping");
        }
        let Some(n) = NonZeroU32::new(clamped) else {
            return;
        };
        if let Err(e) = limiter.until_n_ready(n).await {
            warn!("{class} rate limiter cannot satisfy weight {clamped}: {e}");
        }
    }
}

/// Request weight of one REST call, per the exchange's published tables.
#[must_use]
pub fn request_weight(method: &Method, path: &str, query: &QueryParams) -> u32 {
    match path {
        "/api/v3/klines" | "/fapi/v1/klines" => kline_weight(query),
        "/api/v3/depth" => spot_depth_weight(query),
        "/fapi/v1/depth" => futures_depth_weight(query),
        "/api/v3/ticker/24hr" | "/fapi/v1/ticker/24hr" => {
            if query.has("symbol") {
                1
            } else {
                40
            }
        }
        "/api/v3/exchangeInfo" | "/fapi/v1/exchangeInfo" => 10,
        "/api/v3/account" => 10,
        "/api/v3/myTrades" => 10,
        "/api/v3/order" => {
            if method == Method::GET {
                2
            } else {
                1
            }
        }
        "/fapi/v1/userTrades" => 5,
        "/fapi/v2/account" => 5,
        "/api/v3/allOrders" => 10,
        "/fapi/v1/allOrders" => 5,
        "/api/v3/openOrders" => {
            if query.has("symbol") {
                3
            } else {
                40
            }
        }
        "/fapi/v1/openOrders" => {
            if query.has("symbol") {
                1
            } else {
                5
            }
        }
        _ => 1,
    }
}

fn parsed_limit(query: &QueryParams) -> Option<i64> {
    query.get("limit").and_then(|v| v.parse::<i64>().ok())
}

fn kline_weight(query: &QueryParams) -> u32 {
    match parsed_limit(query) {
        None => 1,
        Some(limit) if limit <= 100 => 1,
        Some(limit) if limit <= 500 => 2,
        Some(limit) if limit <= 1000 => 5,
        Some(_) => 10,
    }
}

fn spot_depth_weight(query: &QueryParams) -> u32 {
    match parsed_limit(query) {
        None => 1,
        Some(limit) if limit <= 100 => 1,
        Some(limit) if limit <= 500 => 5,
        Some(1000) => 10,
        Some(5000) => 50,
        Some(_) => 1,
    }
}

fn futures_depth_weight(query: &QueryParams) -> u32 {
    match parsed_limit(query) {
        None => 2,
        Some(limit) if limit <= 50 => 2,
        Some(100) => 5,
        Some(500) => 10,
        Some(1000) => 20,
        Some(_) => 2,
    }
}
