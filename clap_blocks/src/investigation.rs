//! CLI config for the investigator's probing schedule.

use backoff::BackoffConfig;
use std::time::Duration;

/// Knobs for how hard chemist tries to reach a suspect flask before
/// declaring it lost.
#[derive(Debug, Clone, clap::Parser)]
pub struct InvestigationClapConfig {
    /// Consecutive failed probes before a flask is declared lost.
    #[clap(
        long = "--max-investigating-retries",
        env = "CHEMIST_MAX_INVESTIGATING_RETRIES",
        default_value = "11",
        action
    )]
    pub max_investigating_retries: usize,

    /// First delay between probes; doubles each round.
    #[clap(
        long = "--investigation-base-backoff",
        env = "CHEMIST_INVESTIGATION_BASE_BACKOFF",
        default_value = "500ms",
        value_parser = humantime::parse_duration
    )]
    pub base_backoff: Duration,

    /// Ceiling on the delay between probes.
    #[clap(
        long = "--investigation-max-backoff",
        env = "CHEMIST_INVESTIGATION_MAX_BACKOFF",
        default_value = "2m",
        value_parser = humantime::parse_duration
    )]
    pub max_backoff: Duration,
}

impl InvestigationClapConfig {
    /// The backoff schedule for probe retries.
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            init_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            ..Default::default()
        }
    }
}
