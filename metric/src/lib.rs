//! In-process metric instrumentation.
//!
//! A [`Registry`] owns named instruments. Each instrument is a [`Metric`]
//! keyed by a set of [`Attributes`], so one logical metric (e.g. lifecycle
//! events) can carry per-kind observations. Recorders are cheap clones that
//! share storage with the registry, so call sites can hold them directly.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A set of key-value pairs distinguishing observations within one metric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Set an attribute, replacing any previous value for the key.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Iterate over the attribute pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_ref()))
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(pairs.iter().map(|(k, v)| (*k, Cow::Borrowed(*v))).collect())
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(pairs.iter().map(|(k, v)| (*k, Cow::Borrowed(*v))).collect())
    }
}

/// A single reported value together with the attributes it was recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Attributes of the recorder that produced this value.
    pub attributes: Attributes,
    /// The current value.
    pub value: u64,
}

/// Storage shared between a [`Metric`] in the registry and its recorders.
pub trait MetricObserver: Clone + Default + Send + Sync + 'static {
    /// Read the current value.
    fn observe(&self) -> u64;
}

/// A monotonic counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current count.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    fn observe(&self) -> u64 {
        self.fetch()
    }
}

/// A named instrument holding one observer per distinct attribute set.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

// Manual impl: `T` need not be `Clone` for the metric handle to be.
impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// The instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The instrument description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the recorder for the given attributes, creating it on first use.
    ///
    /// The recorder shares storage with the registry; increments are visible
    /// to [`Metric::get_observer`] and registry reports.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Return the observer recorded under `attributes`, if any.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

trait Instrument: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn report(&self) -> (&'static str, &'static str, Vec<Observation>);
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn report(&self) -> (&'static str, &'static str, Vec<Observation>) {
        let observations = self
            .observers
            .lock()
            .iter()
            .map(|(attributes, observer)| Observation {
                attributes: attributes.clone(),
                value: observer.observe(),
            })
            .collect();
        (self.name, self.description, observations)
    }
}

/// A process-wide collection of named instruments.
#[derive(Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("instruments", &self.instruments.lock().len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch the previously registered) metric with this name.
    ///
    /// Panics if `name` was already registered with a different observer type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        match instruments.get(name) {
            Some(instrument) => instrument
                .as_any()
                .downcast_ref::<Metric<T>>()
                .expect("metric registered with a different type")
                .clone(),
            None => {
                let metric = Metric::<T>::new(name, description);
                instruments.insert(name, Box::new(metric.clone()));
                metric
            }
        }
    }

    /// Look up a previously registered instrument.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|instrument| instrument.as_any().downcast_ref::<Metric<T>>().cloned())
    }

    /// Snapshot every instrument: `(name, description, observations)`.
    pub fn report(&self) -> Vec<(&'static str, &'static str, Vec<Observation>)> {
        self.instruments
            .lock()
            .values()
            .map(|instrument| instrument.report())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_recorders_share_storage() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> =
            registry.register_metric("events", "number of events observed");

        let launch = metric.recorder(&[("kind", "launch")]);
        launch.inc(1);
        launch.inc(2);
        metric.recorder(&[("kind", "launch")]).inc(1);
        metric.recorder(&[("kind", "terminate")]).inc(5);

        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("kind", "launch")]))
                .unwrap()
                .fetch(),
            4
        );
        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("kind", "terminate")]))
                .unwrap()
                .fetch(),
            5
        );
        assert!(metric
            .get_observer(&Attributes::from(&[("kind", "unknown")]))
            .is_none());
    }

    #[test]
    fn register_is_idempotent() {
        let registry = Registry::new();
        let a: Metric<U64Counter> = registry.register_metric("x", "x");
        let b: Metric<U64Counter> = registry.register_metric("x", "x");

        a.recorder(&[("k", "v")]).inc(3);
        assert_eq!(
            b.get_observer(&Attributes::from(&[("k", "v")]))
                .unwrap()
                .fetch(),
            3
        );

        let found = registry.get_instrument::<U64Counter>("x").unwrap();
        assert_eq!(found.name(), "x");
        assert!(registry.get_instrument::<U64Counter>("y").is_none());
    }

    #[test]
    fn report_covers_all_instruments() {
        let registry = Registry::new();
        registry
            .register_metric::<U64Counter>("a", "first")
            .recorder(&[("k", "1")])
            .inc(1);
        registry
            .register_metric::<U64Counter>("b", "second")
            .recorder(&[("k", "2")])
            .inc(2);

        let report = registry.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].0, "a");
        assert_eq!(report[0].2[0].value, 1);
        assert_eq!(report[1].0, "b");
        assert_eq!(report[1].2[0].value, 2);
    }
}
