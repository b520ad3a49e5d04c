//! The TOML seed file: statically configured flasks and targets registered
//! at bootstrap, before any cloud event arrives.
//!
//! ```toml
//! [flasks.i-flask01.location]
//! host = "10.0.0.1"
//! port = 5775
//! datacenter = "us-east-1a"
//! target-resource-templates = ["http://@host:@port/stream/previous"]
//!
//! [instances.i-target01]
//! cluster-name = "accounts-blue"
//! uris = ["http://10.0.0.2:1234/stream/previous"]
//! ```

use data_types::{Flask, FlaskId, FlaskState, Location, ResourceTemplate, Target, TargetId};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::Path;

/// Seed file errors; fatal at bootstrap.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The file could not be read.
    #[snafu(display("cannot read seeds file {}: {}", path.display(), source))]
    Unreadable {
        /// The configured path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML of the expected shape.
    #[snafu(display("malformed seeds file {}: {}", path.display(), source))]
    Malformed {
        /// The configured path.
        path: std::path::PathBuf,
        /// The underlying parse error.
        source: toml::de::Error,
    },
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_intent() -> String {
    "mirroring".to_string()
}

/// A statically configured target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SeedInstance {
    /// The cluster cohort reported for the target.
    pub cluster_name: String,
    /// Concrete scrape URIs (no templating; seeds are explicit).
    pub uris: Vec<String>,
}

/// A statically configured flask location.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SeedLocation {
    /// Hostname or address.
    pub host: String,
    /// Admin port.
    pub port: u16,
    /// Telemetry port; falls back to the configured funnel port.
    #[serde(default)]
    pub funnel_port: Option<u16>,
    /// Scheme; defaults to `http`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Datacenter label.
    pub datacenter: String,
    /// Role; defaults to `mirroring`.
    #[serde(default = "default_intent")]
    pub intent: String,
    /// Templates this flask applies to targets it monitors.
    #[serde(default)]
    pub target_resource_templates: Vec<String>,
}

/// A statically configured flask.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SeedFlask {
    /// Where it lives.
    pub location: SeedLocation,
}

/// The whole seed file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Seeds {
    /// Static targets by instance id.
    #[serde(default)]
    pub instances: BTreeMap<String, SeedInstance>,
    /// Static flasks by instance id.
    #[serde(default)]
    pub flasks: BTreeMap<String, SeedFlask>,
}

impl Seeds {
    /// Load and parse a seed file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).context(UnreadableSnafu { path })?;
        Self::from_str(&raw).context(MalformedSnafu { path })
    }

    fn from_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// The seeded flasks as domain records. Locations without an explicit
    /// telemetry port get `default_funnel_port`.
    pub fn seed_flasks(&self, default_funnel_port: u16) -> Vec<Flask> {
        self.flasks
            .iter()
            .map(|(id, seed)| Flask {
                id: FlaskId::new(id.clone()),
                location: Location {
                    host: seed.location.host.clone(),
                    port: seed.location.port,
                    funnel_port: seed.location.funnel_port.unwrap_or(default_funnel_port),
                    protocol: seed.location.protocol.clone(),
                    datacenter: seed.location.datacenter.clone(),
                    intent: seed.location.intent.clone(),
                    templates: seed
                        .location
                        .target_resource_templates
                        .iter()
                        .map(|t| ResourceTemplate::new(t.as_str()))
                        .collect(),
                },
                state: FlaskState::Unknown,
            })
            .collect()
    }

    /// The seeded targets as domain records.
    pub fn seed_targets(&self) -> Vec<Target> {
        self.instances
            .iter()
            .map(|(id, seed)| Target {
                id: TargetId::new(id.clone()),
                cluster: seed.cluster_name.clone(),
                uris: seed.uris.iter().cloned().collect(),
            })
            .collect()
    }
}
