//! The common run configuration: admin listener, fleet defaults, sharding.

use sharder::SharderType;
use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

/// CLI config for the chemist server proper.
#[derive(Debug, Clone, clap::Parser)]
pub struct RunConfig {
    /// Address the admin HTTP API binds to.
    #[clap(
        long = "--host",
        env = "CHEMIST_HOST",
        default_value = "127.0.0.1",
        action
    )]
    pub host: String,

    /// Port the admin HTTP API binds to.
    #[clap(long = "--port", env = "CHEMIST_PORT", default_value = "9467", action)]
    pub port: u16,

    /// Default telemetry port assumed for discovered flasks.
    #[clap(
        long = "--funnel-port",
        env = "CHEMIST_FUNNEL_PORT",
        default_value = "7390",
        action
    )]
    pub funnel_port: u16,

    /// Placement strategy: `random` or `least-loaded`.
    #[clap(
        long = "--sharding-strategy",
        env = "CHEMIST_SHARDING_STRATEGY",
        default_value = "least-loaded",
        action
    )]
    pub sharding_strategy: String,

    /// Upper bound on every outbound command to a flask.
    #[clap(
        long = "--command-timeout",
        env = "CHEMIST_COMMAND_TIMEOUT",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub command_timeout: Duration,

    /// How many distribute deliveries may run concurrently.
    #[clap(
        long = "--distribute-workers",
        env = "CHEMIST_DISTRIBUTE_WORKERS",
        default_value = "16",
        action
    )]
    pub distribute_workers: usize,

    /// Resource templates applied to discovered targets. `@host` and `@port`
    /// are substituted with the target's coordinates. Comma-separated.
    #[clap(
        long = "--target-resource-templates",
        env = "CHEMIST_TARGET_RESOURCE_TEMPLATES",
        default_value = "http://@host:@port/stream/previous",
        use_value_delimiter = true
    )]
    pub target_resource_templates: Vec<String>,

    /// Seed fleet definition loaded at bootstrap (TOML).
    #[clap(long = "--seeds-file", env = "CHEMIST_SEEDS_FILE", action)]
    pub seeds_file: Option<std::path::PathBuf>,

    /// Log filter, e.g. `info` or `chemist=debug,lifecycle=trace`.
    #[clap(
        long = "--log-filter",
        env = "LOG_FILTER",
        default_value = "info",
        action
    )]
    pub log_filter: String,
}

impl RunConfig {
    /// The admin socket address.
    pub fn admin_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    /// The configured placement strategy.
    pub fn sharder_type(&self) -> Result<SharderType, sharder::Error> {
        self.sharding_strategy.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_are_sane() {
        let config = RunConfig::try_parse_from(["chemist"]).unwrap();
        assert_eq!(config.port, 9467);
        assert_eq!(config.funnel_port, 7390);
        assert_eq!(config.command_timeout, Duration::from_secs(2));
        assert_eq!(config.sharder_type().unwrap(), SharderType::LeastLoaded);
        assert_eq!(config.distribute_workers, 16);
        assert!(config.admin_addr().is_ok());
    }

    #[test]
    fn strategy_and_timeout_parse_from_flags() {
        let config = RunConfig::try_parse_from([
            "chemist",
            "--sharding-strategy",
            "random",
            "--command-timeout",
            "750ms",
        ])
        .unwrap();
        assert_eq!(config.sharder_type().unwrap(), SharderType::Random);
        assert_eq!(config.command_timeout, Duration::from_millis(750));
    }

    #[test]
    fn bad_strategy_is_rejected_at_use() {
        let config =
            RunConfig::try_parse_from(["chemist", "--sharding-strategy", "round-robin"]).unwrap();
        assert!(config.sharder_type().is_err());
    }
}
