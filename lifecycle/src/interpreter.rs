//! The state machine translating cloud events into repository mutations and
//! rebalancing actions.
//!
//! `handle_event` performs the repository mutations itself and returns the
//! side effects (the [`Action`] and any drop instructions) as data; the run
//! loop pushes those through the distribute sink. Keeping the effects out of
//! this module makes every transition testable without I/O.

use crate::codec::{CloudEvent, MessageKind};
use data_types::{
    Distribution, Event, EventKind, Flask, FlaskId, FlaskState, Instance, Location,
    ResourceTemplate, Target, TargetId,
};
use discovery::{target_for_instance, InstanceResolver};
use metric::U64Counter;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use repository::Repository;
use sharder::Sharding;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What the interpreter decided to do about an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to distribute.
    NoOp,
    /// Assignments changed; push the delta to the affected flasks.
    Redistributed(Distribution),
}

/// An instruction for a flask to stop monitoring targets it no longer owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discard {
    /// The owning flask.
    pub flask: FlaskId,
    /// Where it lives.
    pub location: Location,
    /// The targets to drop.
    pub targets: Vec<Target>,
}

/// The full result of interpreting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// The rebalancing action.
    pub action: Action,
    /// Drop instructions for flasks that lost targets.
    pub discards: Vec<Discard>,
}

impl Outcome {
    fn noop() -> Self {
        Self {
            action: Action::NoOp,
            discards: vec![],
        }
    }

    fn redistributed(distribution: Distribution) -> Self {
        Self {
            action: Action::Redistributed(distribution),
            discards: vec![],
        }
    }
}

/// Interprets cloud events against the repository.
#[derive(Debug)]
pub struct Interpreter {
    repo: Arc<Repository>,
    resolver: Arc<dyn InstanceResolver>,
    sharder: Mutex<Box<dyn Sharding>>,
    templates: Vec<ResourceTemplate>,
    funnel_port: u16,

    launch_counter: U64Counter,
    terminate_counter: U64Counter,
    other_counter: U64Counter,
}

impl Interpreter {
    /// Create an interpreter over the given collaborators.
    ///
    /// `templates` are the resource templates applied to discovered targets
    /// and handed to discovered flasks; `funnel_port` is the telemetry port
    /// assumed for discovered flasks (cloud metadata does not carry one).
    pub fn new(
        repo: Arc<Repository>,
        resolver: Arc<dyn InstanceResolver>,
        sharder: Box<dyn Sharding>,
        templates: Vec<ResourceTemplate>,
        funnel_port: u16,
        metrics: &metric::Registry,
    ) -> Self {
        let events = metrics.register_metric::<U64Counter>(
            "chemist_lifecycle_events",
            "cloud lifecycle events processed",
        );

        Self {
            repo,
            resolver,
            sharder: Mutex::new(sharder),
            templates,
            funnel_port,
            launch_counter: events.recorder(&[("kind", "launch")]),
            terminate_counter: events.recorder(&[("kind", "terminate")]),
            other_counter: events.recorder(&[("kind", "other")]),
        }
    }

    /// The repository this interpreter mutates.
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Route targets through the sharding strategy and apply the result.
    ///
    /// Also the backing of the operator's force-rebalance endpoint, which
    /// feeds it the unassigned pool.
    pub fn assign(&self, targets: BTreeSet<TargetId>) -> Distribution {
        if targets.is_empty() {
            return Distribution::new();
        }

        let snapshot = self.repo.snapshot();
        let distribution = self.sharder.lock().locate(&targets, &snapshot);
        if distribution.is_empty() {
            info!(
                targets = targets.len(),
                "no active flasks; targets stay unassigned"
            );
            return distribution;
        }

        // The delta only lists assignable flasks from the snapshot; a race
        // with a concurrent terminate surfaces here and is retried on the
        // next event.
        if let Err(e) = self.repo.merge_distribution(distribution.clone()) {
            warn!(error=%e, "distribution no longer applicable, discarding");
            return Distribution::new();
        }
        distribution
    }

    /// Interpret one event: mutate the repository, return the effects.
    pub async fn handle_event(&self, event: &CloudEvent) -> Outcome {
        match event.kind {
            MessageKind::Launch => {
                self.launch_counter.inc(1);
                self.record(event, EventKind::Launch);
                self.handle_launch(event).await
            }
            MessageKind::Terminate => {
                self.terminate_counter.inc(1);
                self.record(event, EventKind::Terminate);
                self.handle_terminate(event)
            }
            MessageKind::Other => {
                self.other_counter.inc(1);
                debug!(instance=%event.instance_id, "ignoring unsupported event kind");
                Outcome::noop()
            }
        }
    }

    fn record(&self, event: &CloudEvent, kind: EventKind) {
        self.repo.record_event(Event {
            kind,
            asg: event.asg.clone(),
            instance_id: event.instance_id.clone(),
            time: event.time,
        });
    }

    async fn handle_launch(&self, event: &CloudEvent) -> Outcome {
        let instance = match self.resolver.lookup_one(&event.instance_id).await {
            Ok(instance) => instance,
            Err(discovery::Error::NotFound { id }) => {
                // it raced a terminate; the terminate event will follow
                warn!(instance=%id, "launched instance already gone, skipping");
                return Outcome::noop();
            }
        };

        if instance.is_flask() {
            self.handle_flask_launch(instance)
        } else {
            self.handle_target_launch(instance)
        }
    }

    fn handle_flask_launch(&self, instance: Instance) -> Outcome {
        let flask = self.flask_for_instance(&instance);
        let id = flask.id.clone();
        if let Err(e) = self.repo.increase_capacity(flask) {
            // re-delivery or a duplicate cloud notification
            warn!(flask=%id, error=%e, "flask already registered, treating launch as no-op");
        } else {
            info!(flask=%id, host=%instance.host, "flask joined the fleet");
        }

        let unassigned = self.repo.unassigned();
        if unassigned.is_empty() {
            return Outcome::noop();
        }

        info!(
            flask=%id,
            targets = unassigned.len(),
            "draining unassigned targets onto new capacity"
        );
        Outcome::redistributed(self.assign(unassigned))
    }

    fn handle_target_launch(&self, instance: Instance) -> Outcome {
        let target = target_for_instance(&instance, &self.templates);
        let id = target.id.clone();
        info!(target=%id, cluster=%target.cluster, "target joined the fleet");
        self.repo.add_instance(target);

        Outcome::redistributed(self.assign([id].into()))
    }

    fn handle_terminate(&self, event: &CloudEvent) -> Outcome {
        let id = &event.instance_id;

        if self.repo.flask(&id.as_str().into()).is_some() {
            let flask_id = id.as_str().into();
            let held = self.repo.decrease_capacity(&flask_id);
            info!(flask=%flask_id, targets = held.len(), "flask left the fleet");
            return Outcome::redistributed(self.assign(held));
        }

        let target_id: TargetId = id.as_str().into();
        if let Some((target, owner)) = self.repo.remove_instance(&target_id) {
            info!(target=%target_id, "target left the fleet");
            let discards = owner
                .and_then(|owner| self.repo.flask(&owner))
                .filter(|flask| flask.assignable())
                .map(|flask| Discard {
                    flask: flask.id,
                    location: flask.location,
                    targets: vec![target],
                })
                .into_iter()
                .collect();
            return Outcome {
                action: Action::NoOp,
                discards,
            };
        }

        debug!(instance=%id, "terminate for unknown instance");
        Outcome::noop()
    }

    fn flask_for_instance(&self, instance: &Instance) -> Flask {
        let tag = |name: &str, default: &str| {
            instance
                .tags
                .get(name)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        Flask {
            id: instance.id.as_str().into(),
            location: Location {
                host: instance.host.clone(),
                port: instance.port,
                funnel_port: self.funnel_port,
                protocol: tag("protocol", "http"),
                datacenter: tag("datacenter", "unknown"),
                intent: tag("intent", "mirroring"),
                templates: self.templates.clone(),
            },
            state: FlaskState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemist_time::Time;
    use discovery::MockResolver;
    use sharder::LeastLoaded;
    use std::collections::BTreeMap;

    struct Fixture {
        repo: Arc<Repository>,
        resolver: Arc<MockResolver>,
        interpreter: Interpreter,
    }

    fn fixture() -> Fixture {
        test_helpers::maybe_start_logging();

        let repo = Arc::new(Repository::new());
        let resolver = Arc::new(MockResolver::new());
        let metrics = metric::Registry::new();
        let interpreter = Interpreter::new(
            Arc::clone(&repo),
            Arc::clone(&resolver) as Arc<dyn InstanceResolver>,
            Box::new(LeastLoaded),
            vec![ResourceTemplate::new("http://@host:@port/stream/previous")],
            7390,
            &metrics,
        );
        Fixture {
            repo,
            resolver,
            interpreter,
        }
    }

    fn launch(id: &str) -> CloudEvent {
        CloudEvent {
            kind: MessageKind::Launch,
            asg: "accounts-blue".into(),
            instance_id: id.into(),
            time: Time::from_timestamp_nanos(0),
        }
    }

    fn terminate(id: &str) -> CloudEvent {
        CloudEvent {
            kind: MessageKind::Terminate,
            asg: "accounts-blue".into(),
            instance_id: id.into(),
            time: Time::from_timestamp_nanos(0),
        }
    }

    fn flask_instance(id: &str, host: &str) -> Instance {
        Instance {
            id: id.into(),
            host: host.into(),
            port: 5775,
            asg: "chemist-flasks".into(),
            tags: [("type".to_string(), "flask-mirror".to_string())].into(),
        }
    }

    fn target_instance(id: &str, host: &str) -> Instance {
        Instance {
            id: id.into(),
            host: host.into(),
            port: 1234,
            asg: "accounts-blue".into(),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn target_launch_is_assigned_to_a_flask() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));
        f.resolver.register(target_instance("t1", "10.0.0.2"));

        f.interpreter.handle_event(&launch("f1")).await;
        let outcome = f.interpreter.handle_event(&launch("t1")).await;

        let expected: Distribution = [(FlaskId::new("f1"), [TargetId::new("t1")].into())]
            .into_iter()
            .collect();
        assert_eq!(outcome.action, Action::Redistributed(expected));
        assert_eq!(
            f.repo.assigned_targets(&FlaskId::new("f1")),
            [TargetId::new("t1")].into()
        );

        let target = f.repo.target(&TargetId::new("t1")).unwrap();
        assert_eq!(
            target.uris,
            ["http://10.0.0.2:1234/stream/previous".to_string()].into()
        );
    }

    #[tokio::test]
    async fn target_launch_without_capacity_stays_unassigned() {
        let f = fixture();
        f.resolver.register(target_instance("t1", "10.0.0.2"));

        let outcome = f.interpreter.handle_event(&launch("t1")).await;

        assert_eq!(outcome.action, Action::Redistributed(Distribution::new()));
        assert_eq!(f.repo.unassigned(), [TargetId::new("t1")].into());
    }

    #[tokio::test]
    async fn flask_launch_drains_the_unassigned_pool() {
        let f = fixture();
        f.resolver.register(target_instance("t1", "10.0.0.2"));
        f.resolver.register(flask_instance("f1", "10.0.0.1"));

        f.interpreter.handle_event(&launch("t1")).await;
        let outcome = f.interpreter.handle_event(&launch("f1")).await;

        assert_matches::assert_matches!(outcome.action, Action::Redistributed(_));
        assert_eq!(
            f.repo.assigned_targets(&FlaskId::new("f1")),
            [TargetId::new("t1")].into()
        );
        assert!(f.repo.unassigned().is_empty());
    }

    #[tokio::test]
    async fn flask_launch_with_nothing_pending_is_a_noop() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));

        let outcome = f.interpreter.handle_event(&launch("f1")).await;
        assert_eq!(outcome.action, Action::NoOp);

        // discovered flasks carry the configured telemetry port
        let location = f.repo.flask(&FlaskId::new("f1")).unwrap().location;
        assert_eq!(location.port, 5775);
        assert_eq!(location.funnel_port, 7390);
        assert_eq!(location.funnel_addr(), "10.0.0.1:7390");
    }

    #[tokio::test]
    async fn flask_terminate_reshards_to_survivors() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));
        f.resolver.register(flask_instance("f2", "10.0.0.3"));
        f.resolver.register(target_instance("t1", "10.0.0.2"));

        f.interpreter.handle_event(&launch("f1")).await;
        f.interpreter.handle_event(&launch("f2")).await;
        f.interpreter.handle_event(&launch("t1")).await;

        let owner = if f.repo.assigned_targets(&FlaskId::new("f1")).is_empty() {
            "f2"
        } else {
            "f1"
        };
        let survivor = if owner == "f1" { "f2" } else { "f1" };

        let outcome = f.interpreter.handle_event(&terminate(owner)).await;
        assert_matches::assert_matches!(outcome.action, Action::Redistributed(_));
        assert_eq!(
            f.repo.assigned_targets(&FlaskId::new(survivor)),
            [TargetId::new("t1")].into()
        );
        assert_eq!(
            f.repo.flask(&FlaskId::new(owner)).unwrap().state,
            FlaskState::Terminated
        );
    }

    #[tokio::test]
    async fn last_flask_terminate_parks_targets_unassigned() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));
        f.resolver.register(target_instance("t1", "10.0.0.2"));

        f.interpreter.handle_event(&launch("f1")).await;
        f.interpreter.handle_event(&launch("t1")).await;

        let outcome = f.interpreter.handle_event(&terminate("f1")).await;
        assert_eq!(outcome.action, Action::Redistributed(Distribution::new()));
        assert_eq!(f.repo.unassigned(), [TargetId::new("t1")].into());

        // S2 continued: new capacity picks the parked target up
        f.resolver.register(flask_instance("f2", "10.0.0.3"));
        f.interpreter.handle_event(&launch("f2")).await;
        assert_eq!(
            f.repo.assigned_targets(&FlaskId::new("f2")),
            [TargetId::new("t1")].into()
        );
    }

    #[tokio::test]
    async fn target_terminate_tells_the_owner_to_drop_it() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));
        f.resolver.register(target_instance("t1", "10.0.0.2"));

        f.interpreter.handle_event(&launch("f1")).await;
        f.interpreter.handle_event(&launch("t1")).await;

        let outcome = f.interpreter.handle_event(&terminate("t1")).await;
        assert_eq!(outcome.action, Action::NoOp);
        assert_eq!(outcome.discards.len(), 1);
        assert_eq!(outcome.discards[0].flask, FlaskId::new("f1"));
        assert_eq!(outcome.discards[0].location.host, "10.0.0.1");
        assert_eq!(outcome.discards[0].targets[0].id, TargetId::new("t1"));
        assert!(f.repo.target(&TargetId::new("t1")).is_none());
    }

    #[tokio::test]
    async fn double_launch_is_idempotent() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));

        f.interpreter.handle_event(&launch("f1")).await;
        let outcome = f.interpreter.handle_event(&launch("f1")).await;

        assert_eq!(outcome.action, Action::NoOp);
        assert_eq!(
            f.repo.flask(&FlaskId::new("f1")).unwrap().state,
            FlaskState::Active
        );
    }

    #[tokio::test]
    async fn launch_of_vanished_instance_is_a_noop() {
        let f = fixture();
        let outcome = f.interpreter.handle_event(&launch("i-gone")).await;
        assert_eq!(outcome.action, Action::NoOp);
        assert!(f.repo.flasks().is_empty());
    }

    #[tokio::test]
    async fn terminate_of_unknown_instance_is_a_noop() {
        let f = fixture();
        let outcome = f.interpreter.handle_event(&terminate("i-gone")).await;
        assert_eq!(outcome.action, Action::NoOp);
    }

    #[tokio::test]
    async fn events_land_in_the_ring() {
        let f = fixture();
        f.resolver.register(flask_instance("f1", "10.0.0.1"));

        f.interpreter.handle_event(&launch("f1")).await;
        f.interpreter.handle_event(&terminate("f1")).await;

        let events = f.repo.recent_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Launch);
        assert_eq!(events[1].kind, EventKind::Terminate);
    }
}
