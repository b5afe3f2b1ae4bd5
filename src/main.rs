//! `market-proxy` entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use market_proxy::ProxyConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProxyConfig::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("market-proxy version {}", env!("CARGO_PKG_VERSION"));
    if !config.disable_fake_candles {
        info!(
            "Fake candles are enabled for faster processing, \
             the feature can be disabled with --disable-fake-candles or -c"
        );
    }
    if config.always_show_forwards {
        info!(
            "Always show forwards is enabled, all API requests that can't be \
             served from the websocket cache will be logged"
        );
    }

    market_proxy::run(config).await
}
