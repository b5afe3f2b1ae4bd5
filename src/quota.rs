//! Upstream quota accounting and ban detection.
//!
//! Single source of truth for "may we talk to upstream right now?" per
//! market class. Every outbound attempt (REST bootstrap, exchange-info
//! poll, forwarded request, WebSocket dial failure) reports back here, and
//! every outbound path consults [`QuotaController::is_banned`] first.

use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use http::HeaderMap;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{error, info, warn};

use crate::market::MarketClass;

/// Weight-budget fraction at which requests are suspended preemptively.
const WEIGHT_ALERT_RATIO: f64 = 0.9;

/// Consecutive transport errors before an inferred ban.
const ERROR_BAN_THRESHOLD: u32 = 5;

/// Cap for the inferred-ban exponential backoff.
const MAX_INFERRED_BAN: Duration = Duration::from_secs(600);

/// Transport-error fragments that hint at upstream throttling us at the
/// connection level. Matched case-insensitively against the error chain.
const CONNECTION_ERROR_HINTS: [&str; 4] =
    ["connection refused", "timeout", "timed out", "no route to host"];

/// One upstream HTTP exchange, stripped to what quota accounting needs.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub used_weight: Option<u32>,
    pub body_excerpt: Option<String>,
}

impl ResponseMeta {
    /// Capture status and the quota-relevant headers of a response.
    #[must_use]
    pub fn from_parts(status: u16, headers: &HeaderMap) -> Self {
        let retry_after = headers
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let used_weight = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        Self {
            status,
            retry_after,
            used_weight,
            body_excerpt: None,
        }
    }

    /// Attach (a prefix of) the response body, for ban-expiry scanning.
    #[must_use]
    pub fn with_body(mut self, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(&body[..body.len().min(512)]);
        self.body_excerpt = Some(text.into_owned());
        self
    }
}

/// Active ban, as observed by callers that need to surface it.
#[derive(Debug, Clone)]
pub struct BanStatus {
    pub remaining: Duration,
    pub until: DateTime<Utc>,
}

impl BanStatus {
    /// RFC3339 rendering of the recovery deadline.
    #[must_use]
    pub fn until_rfc3339(&self) -> String {
        self.until.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[derive(Debug)]
struct ClassQuota {
    banned: bool,
    recovery_deadline: Instant,
    recovery_wall: DateTime<Utc>,
    weight_used: u32,
    weight_limit: u32,
    window_end: Instant,
    consecutive_errors: u32,
    last_error: Option<Instant>,
    backoff_exponent: u32,
}

impl ClassQuota {
    fn new(weight_limit: u32) -> Self {
        Self {
            banned: false,
            recovery_deadline: Instant::now(),
            recovery_wall: Utc::now(),
            weight_used: 0,
            weight_limit,
            window_end: Instant::now() + until_next_minute(),
            consecutive_errors: 0,
            last_error: None,
            backoff_exponent: 0,
        }
    }

    fn set_banned(&mut self, duration: Duration) {
        self.banned = true;
        self.recovery_deadline = Instant::now() + duration;
        self.recovery_wall = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

/// Per-class ban and weight state, shared process-wide by reference.
#[derive(Debug)]
pub struct QuotaController {
    spot: Mutex<ClassQuota>,
    futures: Mutex<ClassQuota>,
}

impl Default for QuotaController {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            spot: Mutex::new(ClassQuota::new(MarketClass::Spot.default_weight_limit())),
            futures: Mutex::new(ClassQuota::new(MarketClass::Futures.default_weight_limit())),
        }
    }

    fn class(&self, class: MarketClass) -> &Mutex<ClassQuota> {
        match class {
            MarketClass::Spot => &self.spot,
            MarketClass::Futures => &self.futures,
        }
    }

    /// Whether outbound traffic for `class` is currently suspended.
    ///
    /// Clears an expired ban as a side effect of the observation.
    pub fn is_banned(&self, class: MarketClass) -> bool {
        let mut q = self.class(class).lock();
        if q.banned && Instant::now() >= q.recovery_deadline {
            q.banned = false;
            info!("{class} API ban lifted, resuming normal operation");
        }
        q.banned
    }

    /// The active ban, if any, without clearing expired state.
    #[must_use]
    pub fn ban_status(&self, class: MarketClass) -> Option<BanStatus> {
        let q = self.class(class).lock();
        if !q.banned {
            return None;
        }
        Some(BanStatus {
            remaining: q.recovery_deadline.saturating_duration_since(Instant::now()),
            until: q.recovery_wall,
        })
    }

    /// Current `(used, limit)` request weight for `class`.
    #[must_use]
    pub fn weight_info(&self, class: MarketClass) -> (u32, u32) {
        let q = self.class(class).lock();
        (q.weight_used, q.weight_limit)
    }

    /// Digest the outcome of one outbound attempt. Returns `true` when the
    /// observation triggered (or confirmed) a ban; callers must then serve
    /// the synthetic-empty path instead of the upstream payload.
    pub fn check_response(
        &self,
        class: MarketClass,
        resp: Option<&ResponseMeta>,
        transport_error: Option<&str>,
    ) -> bool {
        let mut q = self.class(class).lock();
        let now = Instant::now();

        if let Some(resp) = resp {
            // Roll the per-minute window, then track the weight budget:
            // trust the header, estimate otherwise.
            if now >= q.window_end {
                q.weight_used = 0;
                q.window_end = now + until_next_minute();
            }
            match resp.used_weight {
                Some(weight) => q.weight_used = weight,
                None => q.weight_used = q.weight_used.saturating_add(1),
            }

            if f64::from(q.weight_used) / f64::from(q.weight_limit) >= WEIGHT_ALERT_RATIO {
                let wait = until_next_minute();
                q.set_banned(wait);
                warn!(
                    "{class} API weight limit approaching ({}/{}), suspending requests until {}",
                    q.weight_used,
                    q.weight_limit,
                    q.recovery_wall.to_rfc3339_opts(SecondsFormat::Secs, true),
                );
                return true;
            }

            match resp.status {
                418 => {
                    let duration = resp
                        .retry_after
                        .map(Duration::from_secs)
                        .or_else(|| resp.body_excerpt.as_deref().and_then(ban_expiry_from_body))
                        .unwrap_or(Duration::from_secs(600));
                    q.set_banned(duration);
                    q.backoff_exponent = 0;
                    error!(
                        "{class} API IP banned (418), suspending requests until {}",
                        q.recovery_wall.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                    return true;
                }
                429 => {
                    let duration = resp
                        .retry_after
                        .map(Duration::from_secs)
                        .unwrap_or(Duration::from_secs(60));
                    q.set_banned(duration);
                    q.backoff_exponent = 0;
                    warn!(
                        "{class} API rate limited (429), suspending requests until {}",
                        q.recovery_wall.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                    return true;
                }
                403 => {
                    q.set_banned(Duration::from_secs(300));
                    warn!(
                        "{class} API access forbidden (403), suspending requests until {}",
                        q.recovery_wall.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                    return true;
                }
                200 => {
                    q.consecutive_errors = 0;
                    q.backoff_exponent = 0;
                }
                _ => {}
            }
        }

        if let Some(err) = transport_error {
            let err = err.to_lowercase();
            if CONNECTION_ERROR_HINTS.iter().any(|hint| err.contains(hint)) {
                if q.last_error
                    .map_or(true, |t| now.duration_since(t) > Duration::from_secs(60))
                {
                    q.consecutive_errors = 0;
                }
                q.consecutive_errors += 1;
                q.last_error = Some(now);

                if q.consecutive_errors >= ERROR_BAN_THRESHOLD {
                    let duration =
                        Duration::from_secs(1u64 << q.backoff_exponent.min(16)).min(MAX_INFERRED_BAN);
                    q.backoff_exponent = q.backoff_exponent.saturating_add(1);
                    let errors = q.consecutive_errors;
                    q.consecutive_errors = 0;
                    q.set_banned(duration);
                    warn!(
                        "{class} API connection issues detected ({errors} errors), \
                         suspending requests for {duration:?} until {}",
                        q.recovery_wall.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                    return true;
                }
            }
        }

        false
    }
}

/// Time left until the next wall-clock minute boundary.
fn until_next_minute() -> Duration {
    let millis = Utc::now().timestamp_millis();
    let remainder = millis.rem_euclid(60_000);
    Duration::from_millis((60_000 - remainder) as u64)
}

/// Scan an error body for a unix timestamp (10- or 13-digit) and turn it
/// into a ban duration from now.
fn ban_expiry_from_body(body: &str) -> Option<Duration> {
    let re = Regex::new(r"(\d{10,13})").ok()?;
    let ts: i64 = re.captures(body)?.get(1)?.as_str().parse().ok()?;
    let ts_secs = if ts > 9_999_999_999 { ts / 1000 } else { ts };
    let remaining = ts_secs - Utc::now().timestamp();
    Some(Duration::from_secs(remaining.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn meta(status: u16) -> ResponseMeta {
        ResponseMeta {
            status,
            ..ResponseMeta::default()
        }
    }

    #[test]
    fn weight_header_overrides_estimate() {
        let quota = QuotaController::new();
        let mut m = meta(200);
        m.used_weight = Some(137);
        quota.check_response(MarketClass::Spot, Some(&m), None);
        assert_eq!(quota.weight_info(MarketClass::Spot).0, 137);

        // Without the header the estimator increments by one per response.
        quota.check_response(MarketClass::Spot, Some(&meta(200)), None);
        assert_eq!(quota.weight_info(MarketClass::Spot).0, 138);
    }

    #[test]
    fn approaching_weight_limit_suspends_until_minute_boundary() {
        let quota = QuotaController::new();
        let mut m = meta(200);
        m.used_weight = Some(1100);
        assert!(quota.check_response(MarketClass::Spot, Some(&m), None));
        assert!(quota.is_banned(MarketClass::Spot));
        let status = quota.ban_status(MarketClass::Spot).unwrap();
        assert!(status.remaining <= Duration::from_secs(60));
        // Futures budget is untouched.
        assert!(!quota.is_banned(MarketClass::Futures));
    }

    #[test]
    fn teapot_with_retry_after_sets_deadline_and_lifts() {
        let quota = QuotaController::new();
        let mut m = meta(418);
        m.retry_after = Some(120);
        assert!(quota.check_response(MarketClass::Futures, Some(&m), None));
        let status = quota.ban_status(MarketClass::Futures).unwrap();
        assert!(status.remaining > Duration::from_secs(115));
        assert!(status.remaining <= Duration::from_secs(120));

        // An expired ban clears on the next observation.
        let mut m = meta(418);
        m.retry_after = Some(0);
        quota.check_response(MarketClass::Spot, Some(&m), None);
        assert!(!quota.is_banned(MarketClass::Spot));
    }

    #[test]
    fn teapot_parses_expiry_from_body() {
        let quota = QuotaController::new();
        let expiry_ms = (Utc::now().timestamp() + 300) * 1000;
        let body = format!(r#"{{"code":-1003,"msg":"banned until {expiry_ms}"}}"#);
        let m = meta(418).with_body(body.as_bytes());
        assert!(quota.check_response(MarketClass::Spot, Some(&m), None));
        let status = quota.ban_status(MarketClass::Spot).unwrap();
        assert!(status.remaining > Duration::from_secs(290));
        assert!(status.remaining <= Duration::from_secs(300));
    }

    #[test]
    fn teapot_without_hints_defaults_to_ten_minutes() {
        let quota = QuotaController::new();
        assert!(quota.check_response(MarketClass::Spot, Some(&meta(418)), None));
        let status = quota.ban_status(MarketClass::Spot).unwrap();
        assert!(status.remaining > Duration::from_secs(595));
        assert!(status.remaining <= Duration::from_secs(600));
    }

    #[test]
    fn rate_limited_defaults_to_one_minute() {
        let quota = QuotaController::new();
        assert!(quota.check_response(MarketClass::Spot, Some(&meta(429)), None));
        let status = quota.ban_status(MarketClass::Spot).unwrap();
        assert!(status.remaining > Duration::from_secs(55));
        assert!(status.remaining <= Duration::from_secs(60));
    }

    #[test]
    fn forbidden_suspends_for_five_minutes() {
        let quota = QuotaController::new();
        assert!(quota.check_response(MarketClass::Futures, Some(&meta(403)), None));
        let status = quota.ban_status(MarketClass::Futures).unwrap();
        assert!(status.remaining > Duration::from_secs(295));
        assert!(status.remaining <= Duration::from_secs(300));
    }

    #[test]
    fn connection_errors_ban_after_threshold() {
        let quota = QuotaController::new();
        for _ in 0..ERROR_BAN_THRESHOLD - 1 {
            assert!(!quota.check_response(
                MarketClass::Spot,
                None,
                Some("tcp connect error: Connection refused (os error 111)"),
            ));
        }
        assert!(quota.check_response(
            MarketClass::Spot,
            None,
            Some("tcp connect error: Connection refused (os error 111)"),
        ));
        // First inferred ban is 2^0 = 1 second.
        let status = quota.ban_status(MarketClass::Spot).unwrap();
        assert!(status.remaining <= Duration::from_secs(1));
    }

    #[test]
    fn unrelated_errors_do_not_count() {
        let quota = QuotaController::new();
        for _ in 0..10 {
            assert!(!quota.check_response(
                MarketClass::Spot,
                None,
                Some("certificate verify failed"),
            ));
        }
        assert!(!quota.is_banned(MarketClass::Spot));
    }

    #[test]
    fn success_resets_error_streak() {
        let quota = QuotaController::new();
        for _ in 0..ERROR_BAN_THRESHOLD - 1 {
            quota.check_response(MarketClass::Spot, None, Some("timeout"));
        }
        quota.check_response(MarketClass::Spot, Some(&meta(200)), None);
        for _ in 0..ERROR_BAN_THRESHOLD - 1 {
            assert!(!quota.check_response(MarketClass::Spot, None, Some("timeout")));
        }
        assert!(!quota.is_banned(MarketClass::Spot));
    }

    #[test]
    fn retry_after_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from_static("42"));
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("256"));
        let m = ResponseMeta::from_parts(429, &headers);
        assert_eq!(m.retry_after, Some(42));
        assert_eq!(m.used_weight, Some(256));
    }
}
