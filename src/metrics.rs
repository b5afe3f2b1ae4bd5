//! Request accounting and metric registration.
//!
//! Counters are emitted through the `metrics` facade; exposition is up to
//! whatever recorder the embedding process installs. The proxy itself only
//! needs the coarse totals that back the `/status` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::describe_counter;
use serde::Serialize;

/// Register metric descriptions once at startup.
pub fn describe() {
    describe_counter!(
        "market_proxy_http_requests_total",
        "Total inbound HTTP requests"
    );
    describe_counter!(
        "market_proxy_forwards_total",
        "Requests forwarded to upstream instead of served from cache"
    );
    describe_counter!(
        "market_proxy_synthetic_responses_total",
        "Synthetic empty responses served during upstream bans"
    );
    describe_counter!(
        "market_proxy_ws_messages_total",
        "WebSocket frames received across all instrument streams"
    );
    describe_counter!(
        "market_proxy_ws_reconnects_total",
        "WebSocket reconnect attempts across all instrument streams"
    );
    describe_counter!(
        "market_proxy_rate_limit_waits_total",
        "Outbound calls that had to wait on the class token bucket"
    );
}

/// Process-wide request/error tallies backing the status endpoint.
#[derive(Debug)]
pub struct StatusCounters {
    started: Instant,
    started_wall: DateTime<Utc>,
    requests: AtomicU64,
    errors: AtomicU64,
    forwards: AtomicU64,
}

/// Serializable view of [`StatusCounters`].
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub service: &'static str,
    pub start_time: String,
    pub uptime_seconds: u64,
    pub requests: u64,
    pub errors: u64,
    pub forwards: u64,
    pub error_rate: f64,
}

impl Default for StatusCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCounters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_wall: Utc::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            forwards: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("market_proxy_http_requests_total").increment(1);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("market_proxy_forwards_total").increment(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let error_rate = if requests > 0 {
            errors as f64 / requests as f64 * 100.0
        } else {
            0.0
        };
        StatusSnapshot {
            service: "market-proxy",
            start_time: self
                .started_wall
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_seconds: self.started.elapsed().as_secs(),
            requests,
            errors,
            forwards: self.forwards.load(Ordering::Relaxed),
            error_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = StatusCounters::new();
        for _ in 0..10 {
            counters.record_request();
        }
        counters.record_error();
        counters.record_forward();

        let snap = counters.snapshot();
        assert_eq!(snap.requests, 10);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.forwards, 1);
        assert!((snap.error_rate - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_rate_is_zero_without_requests() {
        let snap = StatusCounters::new().snapshot();
        assert_eq!(snap.requests, 0);
        assert!(snap.error_rate.abs() < f64::EPSILON);
    }
}
