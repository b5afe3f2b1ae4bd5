//! `market-proxy`: read-only caching proxy for Binance market data.
//!
//! Clients issue ordinary HTTP GETs with the exchange's own URL paths; a
//! small set of high-traffic endpoints is answered from a live in-memory
//! mirror fed by upstream WebSocket streams, everything else is forwarded
//! over HTTPS. Features:
//! - Lazy per-(symbol, interval) stream creation with idle eviction
//! - Initial REST backfill for kline windows
//! - Global quota/ban controller gating both REST and WebSocket activity
//! - Weighted token-bucket admission of outbound REST calls
//! - Synthetic empty responses with `Retry-After` during upstream bans

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

pub mod backoff;
pub mod config;
pub mod exchange_info;
pub mod fetch;
pub mod forwarder;
pub mod market;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod stream;
pub mod util;

pub use config::ProxyConfig;
pub use market::{InstrumentKey, MarketClass};
pub use quota::QuotaController;
pub use rate_limit::RateLimiter;
pub use registry::Registry;

use crate::forwarder::Forwarder;
use crate::metrics::StatusCounters;
use crate::server::AppState;
use crate::stream::StreamDeps;

/// Run the proxy until a shutdown signal arrives.
pub async fn run(config: ProxyConfig) -> Result<()> {
    config.validate()?;
    metrics::describe();

    let quota = Arc::new(QuotaController::new());
    let limiter = Arc::new(RateLimiter::new(
        config.spot_bucket(),
        config.futures_bucket(),
    ));
    let http = forwarder::http_client().context("failed to build upstream HTTP client")?;
    let deps = StreamDeps {
        quota: Arc::clone(&quota),
        limiter: Arc::clone(&limiter),
        http: http.clone(),
    };
    let counters = Arc::new(StatusCounters::new());
    let (shutdown_tx, _) = watch::channel(false);

    let mut servers = JoinSet::new();
    let mut registries = Vec::new();

    for class in MarketClass::ALL {
        if !config.class_enabled(class) {
            info!("{class} proxying disabled");
            continue;
        }
        let registry = Registry::new(class, deps.clone());
        let fwd = Arc::new(Forwarder::new(
            class,
            Arc::clone(&quota),
            Arc::clone(&limiter),
            http.clone(),
        ));
        let state = AppState {
            class,
            registry: Arc::clone(&registry),
            forwarder: fwd,
            quota: Arc::clone(&quota),
            counters: Arc::clone(&counters),
            fake_klines: !config.disable_fake_candles,
            always_show_forwards: config.always_show_forwards,
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port(class)));
        servers.spawn(server::serve(addr, state, shutdown_tx.subscribe()));
        registries.push(registry);
    }

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        servers.spawn(server::serve_aux(
            addr,
            Arc::clone(&counters),
            Arc::clone(&quota),
            shutdown_tx.subscribe(),
        ));
    }

    let failure = tokio::select! {
        () = wait_for_signal() => {
            info!("shutdown signal received, stopping services");
            None
        }
        result = servers.join_next() => match result {
            Some(Ok(Err(e))) => Some(e),
            Some(Err(e)) => Some(anyhow::Error::new(e)),
            _ => Some(anyhow::anyhow!("listener exited unexpectedly")),
        },
    };

    shutdown_tx.send_replace(true);
    for registry in &registries {
        registry.shutdown().await;
    }
    servers.shutdown().await;

    match failure {
        Some(e) => {
            error!("fatal: {e:#}");
            Err(e)
        }
        None => Ok(()),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
