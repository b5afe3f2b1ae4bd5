//! Ban propagation across the quota controller and the forwarder.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use rstest::rstest;
use serial_test::serial;

use market_proxy::forwarder::Forwarder;
use market_proxy::quota::{QuotaController, ResponseMeta};
use market_proxy::rate_limit::{BucketConfig, RateLimiter};
use market_proxy::MarketClass;

#[fixture]
fn quota() -> Arc<QuotaController> {
    Arc::new(QuotaController::new())
}

fn forwarder(class: MarketClass, quota: &Arc<QuotaController>) -> Forwarder {
    let limiter = Arc::new(RateLimiter::new(
        BucketConfig {
            rps: 20,
            burst: 1200,
        },
        BucketConfig {
            rps: 40,
            burst: 2400,
        },
    ));
    Forwarder::new(
        class,
        Arc::clone(quota),
        limiter,
        reqwest::Client::new(),
    )
}

fn teapot(retry_after: u64) -> ResponseMeta {
    ResponseMeta {
        status: 418,
        retry_after: Some(retry_after),
        ..ResponseMeta::default()
    }
}

#[rstest]
#[serial]
fn ban_applies_to_one_class_only(quota: Arc<QuotaController>) {
    quota.check_response(MarketClass::Spot, Some(&teapot(120)), None);
    assert!(quota.is_banned(MarketClass::Spot));
    assert!(!quota.is_banned(MarketClass::Futures));
}

#[rstest]
#[tokio::test]
#[serial]
async fn retry_after_decreases_monotonically(quota: Arc<QuotaController>) {
    quota.check_response(MarketClass::Spot, Some(&teapot(120)), None);
    let fwd = forwarder(MarketClass::Spot, &quota);

    let first: u64 = fwd.synthetic_empty("/api/v3/klines").headers()["Retry-After"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let second: u64 = fwd.synthetic_empty("/api/v3/klines").headers()["Retry-After"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();

    assert!(second < first, "retry-after must count down: {first} -> {second}");
    assert!(second >= 1);
}

#[rstest]
#[tokio::test]
#[serial]
async fn ban_lifts_after_the_deadline(quota: Arc<QuotaController>) {
    quota.check_response(MarketClass::Futures, Some(&teapot(1)), None);
    assert!(quota.is_banned(MarketClass::Futures));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!quota.is_banned(MarketClass::Futures));
    assert!(quota.ban_status(MarketClass::Futures).is_none());
}

#[rstest]
#[serial]
fn weight_header_and_window_state_are_visible(quota: Arc<QuotaController>) {
    let meta = ResponseMeta {
        status: 200,
        used_weight: Some(950),
        ..ResponseMeta::default()
    };
    quota.check_response(MarketClass::Spot, Some(&meta), None);
    let (used, limit) = quota.weight_info(MarketClass::Spot);
    assert_eq!(used, 950);
    assert_eq!(limit, 1200);
}
