//! Command-line and environment configuration.
//!
//! Every flag can also be set through an `MPX_`-prefixed environment
//! variable, so container deployments need no argument plumbing.

use anyhow::{bail, Result};
use clap::Parser;

use crate::market::MarketClass;
use crate::rate_limit::BucketConfig;

/// Read-only caching proxy for Binance spot and USD-M futures market data.
#[derive(Debug, Clone, Parser)]
#[command(name = "market-proxy", version, about)]
pub struct ProxyConfig {
    /// Port to bind for SPOT markets.
    #[arg(short = 'p', long, env = "MPX_PORT_SPOT", default_value_t = 8090)]
    pub port_spot: u16,

    /// Port to bind for FUTURES markets.
    #[arg(short = 't', long, env = "MPX_PORT_FUTURES", default_value_t = 8091)]
    pub port_futures: u16,

    /// Disable proxying spot markets.
    #[arg(short = 's', long, env = "MPX_DISABLE_SPOT")]
    pub disable_spot: bool,

    /// Disable proxying futures markets.
    #[arg(short = 'f', long, env = "MPX_DISABLE_FUTURES")]
    pub disable_futures: bool,

    /// Disable generation of fake candles when sockets have not delivered
    /// the current bucket yet.
    #[arg(short = 'c', long, env = "MPX_DISABLE_FAKE_CANDLES")]
    pub disable_fake_candles: bool,

    /// Verbose output (-v debug, -vv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Always log requests forwarded via REST, even without -v.
    #[arg(short = 'a', long, env = "MPX_ALWAYS_SHOW_FORWARDS")]
    pub always_show_forwards: bool,

    /// Spot market requests per second.
    #[arg(long, env = "MPX_SPOT_RPS", default_value_t = 20)]
    pub spot_rps: u32,

    /// Spot market burst capacity.
    #[arg(long, env = "MPX_SPOT_BURST", default_value_t = 1200)]
    pub spot_burst: u32,

    /// Futures market requests per second.
    #[arg(long, env = "MPX_FUTURES_RPS", default_value_t = 40)]
    pub futures_rps: u32,

    /// Futures market burst capacity.
    #[arg(long, env = "MPX_FUTURES_BURST", default_value_t = 2400)]
    pub futures_burst: u32,

    /// Optional port for the auxiliary status/health listener.
    #[arg(long, env = "MPX_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl ProxyConfig {
    /// Reject configurations that cannot serve anything.
    pub fn validate(&self) -> Result<()> {
        if self.disable_spot && self.disable_futures {
            bail!("can't start if both SPOT and FUTURES are disabled");
        }
        Ok(())
    }

    /// Whether a class listener should run.
    #[must_use]
    pub fn class_enabled(&self, class: MarketClass) -> bool {
        match class {
            MarketClass::Spot => !self.disable_spot,
            MarketClass::Futures => !self.disable_futures,
        }
    }

    /// Listener port for a class.
    #[must_use]
    pub fn port(&self, class: MarketClass) -> u16 {
        match class {
            MarketClass::Spot => self.port_spot,
            MarketClass::Futures => self.port_futures,
        }
    }

    #[must_use]
    pub fn spot_bucket(&self) -> BucketConfig {
        BucketConfig {
            rps: self.spot_rps,
            burst: self.spot_burst,
        }
    }

    #[must_use]
    pub fn futures_bucket(&self) -> BucketConfig {
        BucketConfig {
            rps: self.futures_rps,
            burst: self.futures_burst,
        }
    }

    /// Default `EnvFilter` directive for the chosen verbosity.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "market_proxy=info,tower_http=warn",
            1 => "market_proxy=debug,tower_http=debug",
            _ => "market_proxy=trace,tower_http=debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ProxyConfig {
        let mut argv = vec!["market-proxy"];
        argv.extend_from_slice(args);
        ProxyConfig::parse_from(argv)
    }

    #[test]
    fn defaults_match_the_documented_ports_and_buckets() {
        let config = parse(&[]);
        assert_eq!(config.port_spot, 8090);
        assert_eq!(config.port_futures, 8091);
        assert_eq!(config.spot_rps, 20);
        assert_eq!(config.spot_burst, 1200);
        assert_eq!(config.futures_rps, 40);
        assert_eq!(config.futures_burst, 2400);
        assert!(config.metrics_port.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_disabling_both_classes() {
        let config = parse(&["--disable-spot", "--disable-futures"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn verbosity_scales_the_filter() {
        assert!(parse(&[]).log_filter().contains("info"));
        assert!(parse(&["-v"]).log_filter().contains("debug"));
        assert!(parse(&["-vv"]).log_filter().contains("trace"));
    }

    #[test]
    fn short_flags_mirror_the_long_ones() {
        let config = parse(&["-p", "9090", "-t", "9091", "-c", "-a"]);
        assert_eq!(config.port_spot, 9090);
        assert_eq!(config.port_futures, 9091);
        assert!(config.disable_fake_candles);
        assert!(config.always_show_forwards);
    }
}
