//! Placement of targets onto flasks.
//!
//! A sharder is pure over a [`FleetSnapshot`]: it performs no I/O and holds no
//! fleet state of its own, so a decision can be recomputed from any snapshot.
//! The returned [`Distribution`] carries the full resulting target set of
//! every affected flask, which lets the repository replace assignments
//! atomically.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{Distribution, FlaskId, FleetSnapshot, TargetId};
use rand::prelude::*;
use snafu::Snafu;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Sharder errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// An unrecognized strategy name in configuration.
    #[snafu(display("unknown sharding strategy: {}", value))]
    UnknownStrategy {
        /// The offending configuration value.
        value: String,
    },
}

/// A placement strategy.
///
/// Implementations may keep private routing state (e.g. a seeded RNG), which
/// is why `locate` takes `&mut self`; they must not perform I/O.
pub trait Sharding: std::fmt::Debug + Send {
    /// Choose an eligible flask for every target in `new` that is not already
    /// owned, returning the full resulting assignment of each affected flask.
    ///
    /// An empty eligible set yields an empty distribution; the caller keeps
    /// such targets in the unassigned pool.
    fn locate(&mut self, new: &BTreeSet<TargetId>, snapshot: &FleetSnapshot) -> Distribution;
}

fn route<'a>(
    new: &'a BTreeSet<TargetId>,
    snapshot: &FleetSnapshot,
) -> impl Iterator<Item = &'a TargetId> + 'a {
    let owned: Vec<bool> = new.iter().map(|t| snapshot.is_owned(t)).collect();
    new.iter()
        .zip(owned)
        .filter_map(|(t, owned)| (!owned).then(|| t))
}

fn resulting_sets(routed: Vec<(FlaskId, TargetId)>, snapshot: &FleetSnapshot) -> Distribution {
    let mut distribution = Distribution::new();
    for (flask, target) in routed {
        if distribution.get(&flask).is_none() {
            let prior = snapshot
                .assignments
                .get(&flask)
                .cloned()
                .unwrap_or_default();
            distribution.insert(flask.clone(), prior);
        }
        distribution.entry(flask).insert(target);
    }
    distribution
}

/// Uniformly random placement.
///
/// Seedable so that tests (and replayed incidents) are deterministic.
#[derive(Debug)]
pub struct Random {
    rng: StdRng,
}

impl Random {
    /// Create a sharder seeded from the OS.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a sharder with a fixed seed.
    pub fn new_with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Sharding for Random {
    fn locate(&mut self, new: &BTreeSet<TargetId>, snapshot: &FleetSnapshot) -> Distribution {
        let active: Vec<&FlaskId> = snapshot.active().collect();
        if active.is_empty() {
            return Distribution::new();
        }

        let routed = route(new, snapshot)
            .map(|target| {
                let flask = active[self.rng.gen_range(0..active.len())];
                (flask.clone(), target.clone())
            })
            .collect();

        resulting_sets(routed, snapshot)
    }
}

/// Placement onto the least-loaded eligible flask.
///
/// Load counts both the snapshot assignment and the targets already routed
/// within the same call, so one call spreads a batch evenly. Ties break by
/// ascending flask id, which makes the outcome deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl Sharding for LeastLoaded {
    fn locate(&mut self, new: &BTreeSet<TargetId>, snapshot: &FleetSnapshot) -> Distribution {
        if snapshot.assignments.is_empty() {
            return Distribution::new();
        }

        let mut loads: Vec<(FlaskId, usize)> = snapshot
            .active()
            .map(|f| (f.clone(), snapshot.load(f)))
            .collect();

        let mut routed = Vec::new();
        for target in route(new, snapshot) {
            // BTreeMap iteration order makes the first minimum the lowest id.
            let (flask, load) = loads
                .iter_mut()
                .min_by_key(|(id, load)| (*load, id.clone()))
                .expect("checked non-empty above");
            *load += 1;
            routed.push((flask.clone(), target.clone()));
        }

        resulting_sets(routed, snapshot)
    }
}

/// Configured strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharderType {
    /// Uniform random placement.
    Random,
    /// Minimum-load placement.
    LeastLoaded,
}

impl SharderType {
    /// Instantiate the configured strategy.
    pub fn build(&self) -> Box<dyn Sharding> {
        match self {
            Self::Random => Box::new(Random::new()),
            Self::LeastLoaded => Box::new(LeastLoaded),
        }
    }
}

impl FromStr for SharderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "least-loaded" => Ok(Self::LeastLoaded),
            other => UnknownStrategySnafu { value: other }.fail(),
        }
    }
}

impl std::fmt::Display for SharderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::LeastLoaded => write!(f, "least-loaded"),
        }
    }
}
