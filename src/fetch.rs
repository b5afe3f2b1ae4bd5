//! Quota-guarded upstream REST fetches.
//!
//! Every REST call the proxy makes on its own behalf (kline bootstrap,
//! exchange-info poll) goes through [`fetch_bytes`], so the rate limiter
//! and the quota controller see a single consistent picture.

use http::Method;
use thiserror::Error;

use crate::market::MarketClass;
use crate::quota::{QuotaController, ResponseMeta};
use crate::rate_limit::RateLimiter;
use crate::util::QueryParams;

/// Failure modes of a guarded upstream fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The quota controller reported (or inferred) a ban. Callers must
    /// degrade to their serve-empty path instead of retrying.
    #[error("upstream suspended by quota controller")]
    Banned,

    /// Upstream answered outside 2xx without tripping the ban rules.
    #[error("unexpected upstream status {0}")]
    Status(u16),

    /// Transport-level failure worth retrying with backoff.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

/// Rate-limited GET against the class's REST base, returning the raw body.
pub async fn fetch_bytes(
    http: &reqwest::Client,
    quota: &QuotaController,
    limiter: &RateLimiter,
    class: MarketClass,
    path: &str,
    query: &[(&str, &str)],
) -> Result<Vec<u8>, FetchError> {
    if quota.is_banned(class) {
        return Err(FetchError::Banned);
    }

    let params = QueryParams::from_pairs(query);
    limiter.acquire(class, &Method::GET, path, &params).await;

    let url = format!("{}{}", class.rest_base(), path);
    let resp = match http.get(&url).query(query).send().await {
        Ok(resp) => resp,
        Err(e) => return Err(transport_failure(quota, class, e)),
    };

    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let mut meta = ResponseMeta::from_parts(status, &headers);

    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return Err(transport_failure(quota, class, e)),
    };

    if status == 418 && meta.retry_after.is_none() {
        meta = meta.with_body(&bytes);
    }
    if quota.check_response(class, Some(&meta), None) {
        return Err(FetchError::Banned);
    }
    if !(200..300).contains(&status) {
        return Err(FetchError::Status(status));
    }

    Ok(bytes.to_vec())
}

/// Report a transport error to the quota controller and classify it.
fn transport_failure(
    quota: &QuotaController,
    class: MarketClass,
    err: reqwest::Error,
) -> FetchError {
    let chain = format!("{:#}", anyhow::Error::new(err));
    if quota.check_response(class, None, Some(&chain)) {
        FetchError::Banned
    } else {
        FetchError::Transient(anyhow::anyhow!(chain))
    }
}
