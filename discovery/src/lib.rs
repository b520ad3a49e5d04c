//! Instance discovery.
//!
//! Lifecycle events only carry instance ids; the resolver turns an id into
//! the instance's metadata so the interpreter can classify it as a flask or a
//! target. The cloud-backed implementation lives with the deployment; this
//! crate fixes the contract and provides the in-memory resolver used by tests
//! and local runs.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{Instance, ResourceTemplate, Target, TargetId};
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::BTreeMap;

/// Discovery errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The instance is gone. Racing a Terminate event is expected; callers
    /// treat this as "nothing to do".
    #[snafu(display("instance {} not found", id))]
    NotFound {
        /// The id that failed to resolve.
        id: String,
    },
}

/// Looks up instance metadata from the cloud by id.
#[async_trait]
pub trait InstanceResolver: std::fmt::Debug + Send + Sync + 'static {
    /// Resolve a single instance id.
    async fn lookup_one(&self, id: &str) -> Result<Instance, Error>;
}

/// Build the [`Target`] for an instance by applying every resource template
/// to the instance's host and port.
pub fn target_for_instance(instance: &Instance, templates: &[ResourceTemplate]) -> Target {
    Target {
        id: TargetId::new(instance.id.clone()),
        cluster: instance.asg.clone(),
        uris: templates
            .iter()
            .map(|t| t.render(&instance.host, instance.port))
            .collect(),
    }
}

/// An [`InstanceResolver`] backed by a scripted map of instances.
#[derive(Debug, Default)]
pub struct MockResolver {
    instances: Mutex<BTreeMap<String, Instance>>,
}

impl MockResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `instance` resolvable.
    pub fn register(&self, instance: Instance) {
        self.instances.lock().insert(instance.id.clone(), instance);
    }

    /// Forget `id`, simulating a terminated instance.
    pub fn deregister(&self, id: &str) {
        self.instances.lock().remove(id);
    }
}

#[async_trait]
impl InstanceResolver for MockResolver {
    async fn lookup_one(&self, id: &str) -> Result<Instance, Error> {
        self.instances
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.into(),
            host: "10.0.0.2".into(),
            port: 1234,
            asg: "accounts-blue".into(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn targets_render_every_template() {
        let templates = vec![
            ResourceTemplate::new("http://@host:@port/stream/previous"),
            ResourceTemplate::new("http://@host:@port/stream/now?kind=traffic"),
        ];

        let target = target_for_instance(&instance("i-target01"), &templates);
        assert_eq!(target.id, TargetId::new("i-target01"));
        assert_eq!(target.cluster, "accounts-blue");
        assert_eq!(
            target.uris,
            [
                "http://10.0.0.2:1234/stream/previous".to_string(),
                "http://10.0.0.2:1234/stream/now?kind=traffic".to_string(),
            ]
            .into()
        );
    }

    #[test]
    fn duplicate_template_renders_collapse() {
        let templates = vec![
            ResourceTemplate::new("http://@host:@port/stream"),
            ResourceTemplate::new("http://@host:@port/stream"),
        ];

        let target = target_for_instance(&instance("i-target01"), &templates);
        assert_eq!(target.uris.len(), 1);
    }

    #[tokio::test]
    async fn mock_resolver_roundtrip() {
        let resolver = MockResolver::new();
        resolver.register(instance("i-target01"));

        let found = resolver.lookup_one("i-target01").await.unwrap();
        assert_eq!(found.id, "i-target01");

        resolver.deregister("i-target01");
        let err = resolver.lookup_one("i-target01").await.unwrap_err();
        assert_matches!(err, Error::NotFound { .. });
    }
}
