//! Shared data types for the chemist control plane.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chemist_time::Time;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;

/// Cloud instance id of a monitoring flask. Opaque; globally unique within a
/// deployment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlaskId(String);

impl FlaskId {
    /// Wrap a raw instance id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FlaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FlaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Cloud instance id of a monitored application instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(String);

impl TargetId {
    /// Wrap a raw instance id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A URI template carrying `@host` / `@port` placeholders.
///
/// Rendering against a target's host and port yields the concrete URL a flask
/// scrapes for that target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceTemplate(String);

impl ResourceTemplate {
    /// Placeholder substituted with a target's host.
    pub const HOST: &'static str = "@host";
    /// Placeholder substituted with a target's port.
    pub const PORT: &'static str = "@port";

    /// Wrap a raw template string.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Substitute the placeholders, yielding a concrete URI.
    pub fn render(&self, host: &str, port: u16) -> String {
        self.0
            .replace(Self::HOST, host)
            .replace(Self::PORT, &port.to_string())
    }
}

impl Display for ResourceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a flask lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Hostname or address of the flask.
    pub host: String,
    /// Admin port of the flask.
    pub port: u16,
    /// Port the flask publishes telemetry on.
    pub funnel_port: u16,
    /// Scheme used to reach the admin endpoint, e.g. `http`.
    pub protocol: String,
    /// Datacenter the flask runs in.
    pub datacenter: String,
    /// Operator-assigned role of this flask, e.g. `mirroring`.
    pub intent: String,
    /// Templates applied to a target's host/port to derive its scrape URIs.
    pub templates: Vec<ResourceTemplate>,
}

impl Location {
    /// Base URL of the flask admin API.
    pub fn admin_base(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// The endpoint the flask's telemetry stream is subscribed on.
    pub fn funnel_addr(&self) -> String {
        format!("{}:{}", self.host, self.funnel_port)
    }
}

/// Lifecycle state of a flask as chemist believes it to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlaskState {
    /// Seen but not yet confirmed reachable.
    Unknown,
    /// Healthy and eligible for assignment.
    Active,
    /// Suspected dead; under bounded-retry probing.
    Investigating,
    /// Gone. Kept only for id-reuse detection.
    Terminated,
}

impl Display for FlaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Investigating => "investigating",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// A monitoring agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flask {
    /// Instance id.
    pub id: FlaskId,
    /// Network location and scrape templates.
    pub location: Location,
    /// Current state.
    pub state: FlaskState,
}

impl Flask {
    /// A flask receives new work iff it is `Active`.
    pub fn eligible(&self) -> bool {
        self.state == FlaskState::Active
    }

    /// A flask may continue to hold an existing assignment while it is
    /// `Active` or `Investigating`.
    pub fn assignable(&self) -> bool {
        matches!(self.state, FlaskState::Active | FlaskState::Investigating)
    }
}

/// An application instance to be monitored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Instance id.
    pub id: TargetId,
    /// Cluster cohort the instance belongs to.
    pub cluster: String,
    /// Concrete scrape URIs; the target's fingerprint.
    pub uris: BTreeSet<String>,
}

/// Tag value prefix marking an instance as a flask.
pub const FLASK_TYPE_PREFIX: &str = "flask";

/// Raw cloud instance metadata as returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Instance id.
    pub id: String,
    /// Hostname or private address.
    pub host: String,
    /// Port the instance exposes metrics on.
    pub port: u16,
    /// Auto-scaling group the instance belongs to.
    pub asg: String,
    /// Cloud tags.
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// True iff the `type` tag marks this instance as a flask.
    pub fn is_flask(&self) -> bool {
        self.tags
            .get("type")
            .map(|t| t.starts_with(FLASK_TYPE_PREFIX))
            .unwrap_or(false)
    }
}

/// What happened to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The instance came up.
    Launch,
    /// The instance went away.
    Terminate,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch => write!(f, "launch"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// One auto-scaling lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Launch or terminate.
    pub kind: EventKind,
    /// Auto-scaling group that produced the event.
    pub asg: String,
    /// Subject instance.
    pub instance_id: String,
    /// When the cloud says it happened.
    pub time: Time,
}

/// How a metric key is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reportable {
    /// Boolean.
    B,
    /// Double.
    D,
    /// String.
    S,
    /// Summary statistics.
    Stats,
}

/// Order-of-magnitude prefix for byte and duration units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BaseUnit {
    /// No prefix.
    Zero,
    /// 10^3.
    Kilo,
    /// 10^6.
    Mega,
    /// 10^9.
    Giga,
}

/// Granularity of a duration unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeUnit {
    /// Days.
    Days,
    /// Hours.
    Hours,
    /// Microseconds.
    Micro,
    /// Milliseconds.
    Milli,
    /// Minutes.
    Min,
    /// Nanoseconds.
    Nano,
    /// Seconds.
    Sec,
}

/// Unit metadata carried on a metric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Units {
    /// Elapsed time.
    Duration {
        /// Magnitude prefix.
        base: BaseUnit,
        /// Granularity.
        unit: TimeUnit,
    },
    /// A byte quantity.
    Bytes {
        /// Magnitude prefix.
        base: BaseUnit,
    },
    /// A plain count.
    Count,
    /// A ratio in `[0, 1]`.
    Ratio,
    /// Red / amber / green.
    TrafficLight,
    /// A health indicator.
    Healthy,
    /// System load.
    Load,
    /// Unitless.
    None,
}

/// A metric key reported by a flask over telemetry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    /// Dotted metric name, e.g. `jvm.memory`.
    pub name: String,
    /// Reporting discipline.
    pub reportable: Reportable,
    /// Unit metadata.
    pub units: Units,
    /// Human-readable description.
    pub description: String,
    /// Free-form attributes.
    pub attributes: BTreeMap<String, String>,
}

/// The parties named by a telemetry error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    /// The flask reporting the error.
    pub mine: String,
    /// Kind of failure, e.g. `http`.
    pub kind: String,
    /// The peer the flask failed against.
    pub theirs: String,
}

/// A placement delta: the full resulting target set per affected flask.
///
/// Exchanged between the sharder (which computes it), the repository (which
/// applies it atomically) and the distribute sink (which pushes it out).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Distribution(BTreeMap<FlaskId, BTreeSet<TargetId>>);

impl Distribution {
    /// An empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resulting target set for `flask`.
    pub fn insert(&mut self, flask: FlaskId, targets: BTreeSet<TargetId>) {
        self.0.insert(flask, targets);
    }

    /// The resulting target set for `flask`, if it is part of this delta.
    pub fn get(&self, flask: &FlaskId) -> Option<&BTreeSet<TargetId>> {
        self.0.get(flask)
    }

    /// Mutable access, creating an empty entry on first use.
    pub fn entry(&mut self, flask: FlaskId) -> &mut BTreeSet<TargetId> {
        self.0.entry(flask).or_default()
    }

    /// Number of flasks affected.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff no flask is affected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(flask, resulting targets)` pairs in flask-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&FlaskId, &BTreeSet<TargetId>)> {
        self.0.iter()
    }
}

impl IntoIterator for Distribution {
    type Item = (FlaskId, BTreeSet<TargetId>);
    type IntoIter = std::collections::btree_map::IntoIter<FlaskId, BTreeSet<TargetId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(FlaskId, BTreeSet<TargetId>)> for Distribution {
    fn from_iter<I: IntoIterator<Item = (FlaskId, BTreeSet<TargetId>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A consistent copy of the placement-relevant fleet state.
///
/// Produced by the repository under its lock; consumed by placement logic,
/// which therefore never observes concurrent mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FleetSnapshot {
    /// Flasks currently eligible for new work, with their assignments.
    pub assignments: BTreeMap<FlaskId, BTreeSet<TargetId>>,
    /// Owner of every currently assigned target, across active and
    /// investigating flasks.
    pub owners: BTreeMap<TargetId, FlaskId>,
}

impl FleetSnapshot {
    /// Ids of the flasks eligible for assignment, ascending.
    pub fn active(&self) -> impl Iterator<Item = &FlaskId> {
        self.assignments.keys()
    }

    /// Number of targets currently assigned to `flask`.
    pub fn load(&self, flask: &FlaskId) -> usize {
        self.assignments.get(flask).map(|t| t.len()).unwrap_or(0)
    }

    /// True iff some flask already monitors `target`.
    pub fn is_owned(&self, target: &TargetId) -> bool {
        self.owners.contains_key(target)
    }
}

/// Error parsing a [`FlaskState`] or similar enum from a string.
#[derive(Debug, snafu::Snafu)]
#[snafu(display("unknown flask state: {}", value))]
pub struct InvalidFlaskState {
    value: String,
}

impl FromStr for FlaskState {
    type Err = InvalidFlaskState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "active" => Ok(Self::Active),
            "investigating" => Ok(Self::Investigating),
            "terminated" => Ok(Self::Terminated),
            other => InvalidFlaskStateSnafu { value: other }.fail(),
        }
    }
}
