//! Transparent upstream forwarding with ban-aware response rewriting.
//!
//! Non-cacheable traffic is replayed against the class's REST base over a
//! shared pooled client. Every outcome feeds the quota controller, and a
//! banned class answers with well-typed synthetic empties instead of
//! hammering upstream.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::response::Response;
use http::{header, HeaderName, Request, StatusCode};
use tracing::{debug, error, warn};

use crate::market::MarketClass;
use crate::quota::{QuotaController, ResponseMeta};
use crate::rate_limit::RateLimiter;
use crate::util::QueryParams;

/// Largest request body the forwarder will buffer.
const MAX_FORWARD_BODY: usize = 1024 * 1024;

/// Headers that must not be copied between the proxy legs.
const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::UPGRADE,
];

/// Shared upstream HTTP client with the proxy's pooling policy.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(Duration::from_secs(60))
        .build()
}

/// Outbound reverse proxy for one market class.
pub struct Forwarder {
    class: MarketClass,
    quota: Arc<QuotaController>,
    limiter: Arc<RateLimiter>,
    http: reqwest::Client,
}

impl Forwarder {
    #[must_use]
    pub fn new(
        class: MarketClass,
        quota: Arc<QuotaController>,
        limiter: Arc<RateLimiter>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            class,
            quota,
            limiter,
            http,
        }
    }

    /// Replay `req` upstream and pass the answer through, rewriting it to
    /// a synthetic empty when the quota controller vetoes the exchange.
    pub async fn forward(&self, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        if self.quota.is_banned(self.class) {
            debug!("{} API is banned, returning synthetic empty response", self.class);
            return self.synthetic_empty(&path);
        }

        let query = QueryParams::parse(parts.uri.query());
        self.limiter
            .acquire(self.class, &parts.method, &path, &query)
            .await;

        let target = match parts.uri.path_and_query() {
            Some(pq) => format!("{}{}", self.class.rest_base(), pq),
            None => format!("{}{}", self.class.rest_base(), path),
        };

        let body_bytes = to_bytes(body, MAX_FORWARD_BODY).await.unwrap_or_default();

        let mut headers = parts.headers;
        headers.remove(header::HOST);
        // Let the client negotiate compression so bodies arrive decoded.
        headers.remove(header::ACCEPT_ENCODING);
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }

        let sent = self
            .http
            .request(parts.method.clone(), target.as_str())
            .headers(headers)
            .body(body_bytes.to_vec())
            .send()
            .await;

        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(e) => return self.transport_failed(&path, &e.into()),
        };

        let status = upstream.status();
        let resp_headers = upstream.headers().clone();
        let mut meta = ResponseMeta::from_parts(status.as_u16(), &resp_headers);

        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return self.transport_failed(&path, &e.into()),
        };

        if status.as_u16() == 418 && meta.retry_after.is_none() {
            meta = meta.with_body(&bytes);
        }
        if self.quota.check_response(self.class, Some(&meta), None) {
            warn!("{} API banned/limited; returning synthetic response", self.class);
            return self.synthetic_empty(&path);
        }

        let mut builder = Response::builder().status(status);
        if let Some(out) = builder.headers_mut() {
            for (name, value) in &resp_headers {
                if !HOP_BY_HOP.contains(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }
        finish(builder, Body::from(bytes))
    }

    fn transport_failed(&self, path: &str, err: &anyhow::Error) -> Response {
        let chain = format!("{err:#}");
        let ban_triggered = self.quota.check_response(self.class, None, Some(&chain));
        if ban_triggered || self.quota.is_banned(self.class) {
            warn!("{} API transport error treated as ban", self.class);
            return self.synthetic_empty(path);
        }
        error!("{} proxy transport error: {chain}", self.class);
        finish(
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CACHE_CONTROL, "no-store")
                .header("Data-Source", "proxy-error"),
            Body::from(r#"{"error":"bad_gateway","message":"upstream fetch failed"}"#),
        )
    }

    /// Empty but well-typed body for the path, served with 429 and backoff
    /// headers so clients know when to return.
    pub fn synthetic_empty(&self, path: &str) -> Response {
        metrics::counter!("market_proxy_synthetic_responses_total").increment(1);
        let body = match path {
            "/api/v3/klines" | "/fapi/v1/klines" => "[]",
            "/api/v3/depth" | "/fapi/v1/depth" => r#"{"lastUpdateId":0,"bids":[],"asks":[]}"#,
            _ => "{}",
        };

        let mut builder = Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::CONTENT_TYPE, "application/json")
            .header("Data-Source", "ban-protection")
            .header(header::CACHE_CONTROL, "no-store")
            .header("X-Proxy-Empty", "1");

        if let Some(ban) = self.quota.ban_status(self.class) {
            builder = builder
                .header(header::RETRY_AFTER, ban.remaining.as_secs().max(1).to_string())
                .header("X-Backoff-Until", ban.until_rfc3339());
        }

        finish(builder, Body::from(body))
    }
}

fn finish(builder: http::response::Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|_| {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}
