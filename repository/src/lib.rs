//! The authoritative in-memory model of the monitored fleet.
//!
//! Every component reads and mutates fleet state exclusively through the
//! [`Repository`]. A single mutex serializes mutations, so all operations are
//! linearizable and readers always observe a consistent snapshot. Nothing here
//! performs I/O; state is rebuilt from the cloud and from flask telemetry on
//! restart.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{
    Distribution, Event, Flask, FlaskId, FlaskState, FleetSnapshot, Key, Target, TargetId,
};
use observability_deps::tracing::warn;
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::mpsc;

/// How many lifecycle events the repository retains for operator inspection.
pub const MAX_RECENT_EVENTS: usize = 100;

/// Capacity of each change-notification channel handed out by
/// [`Repository::watch`].
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Repository errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// A flask id was launched twice without an intervening terminate.
    #[snafu(display("flask {} already registered in state {}", id, state))]
    AlreadyKnown {
        /// The conflicting id.
        id: FlaskId,
        /// The state the existing registration is in.
        state: FlaskState,
    },

    /// A distribution listed a flask that cannot hold assignments.
    #[snafu(display("flask {} cannot receive assignments", id))]
    NotAssignable {
        /// The offending flask.
        id: FlaskId,
    },
}

/// Emitted on every repository mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    /// A flask was registered as Active.
    FlaskAdded(FlaskId),
    /// A flask changed state.
    FlaskStateChanged(FlaskId, FlaskState),
    /// A target entered the fleet.
    TargetAdded(TargetId),
    /// A target left the fleet.
    TargetRemoved(TargetId),
    /// Assignments changed (merge or capacity decrease).
    AssignmentChanged,
}

#[derive(Debug, Default)]
struct State {
    flasks: BTreeMap<FlaskId, Flask>,
    targets: BTreeMap<TargetId, Target>,

    // Kept in sync under the single writer: lookups by either end are O(log n)
    // without scanning.
    assignments: BTreeMap<FlaskId, BTreeSet<TargetId>>,
    owners: BTreeMap<TargetId, FlaskId>,

    unassigned: BTreeSet<TargetId>,
    events: VecDeque<Event>,
    keys: BTreeMap<FlaskId, BTreeSet<Key>>,
    watchers: Vec<mpsc::Sender<ChangeNotification>>,
}

impl State {
    fn notify(&mut self, change: ChangeNotification) {
        self.watchers
            .retain(|tx| match tx.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(?change, "change watcher lagging, notification dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    fn detach_target(&mut self, target: &TargetId) {
        if let Some(owner) = self.owners.remove(target) {
            if let Some(held) = self.assignments.get_mut(&owner) {
                held.remove(target);
            }
        }
        self.unassigned.remove(target);
    }
}

/// Single authoritative source of fleet state.
#[derive(Debug, Default)]
pub struct Repository {
    state: Mutex<State>,
}

impl Repository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to change notifications.
    ///
    /// Each call returns an independent bounded channel that observes every
    /// subsequent mutation. A watcher that falls more than
    /// `WATCH_CHANNEL_CAPACITY` notifications behind loses the overflow; a
    /// dropped receiver unsubscribes on the next mutation.
    pub fn watch(&self) -> mpsc::Receiver<ChangeNotification> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.state.lock().watchers.push(tx);
        rx
    }

    /// Register a new Active flask.
    ///
    /// Re-registration of a Terminated id is a relaunch and succeeds; any
    /// other existing state is a conflict.
    pub fn increase_capacity(&self, flask: Flask) -> Result<(), Error> {
        let mut state = self.state.lock();

        if let Some(existing) = state.flasks.get(&flask.id) {
            if existing.state != FlaskState::Terminated {
                return AlreadyKnownSnafu {
                    id: flask.id.clone(),
                    state: existing.state,
                }
                .fail();
            }
        }

        let id = flask.id.clone();
        state.flasks.insert(
            id.clone(),
            Flask {
                state: FlaskState::Active,
                ..flask
            },
        );
        state.assignments.entry(id.clone()).or_default();
        state.keys.remove(&id);
        state.notify(ChangeNotification::FlaskAdded(id));
        Ok(())
    }

    /// Transition a flask to Terminated and release its targets into the
    /// unassigned pool, returning them for repartitioning. Idempotent.
    pub fn decrease_capacity(&self, id: &FlaskId) -> BTreeSet<TargetId> {
        let mut state = self.state.lock();

        let held = state.assignments.remove(id).unwrap_or_default();
        for target in &held {
            state.owners.remove(target);
            if state.targets.contains_key(target) {
                state.unassigned.insert(target.clone());
            }
        }
        state.keys.remove(id);

        let known = if let Some(flask) = state.flasks.get_mut(id) {
            flask.state = FlaskState::Terminated;
            true
        } else {
            false
        };

        if known {
            state.notify(ChangeNotification::FlaskStateChanged(
                id.clone(),
                FlaskState::Terminated,
            ));
        }
        if !held.is_empty() {
            state.notify(ChangeNotification::AssignmentChanged);
        }
        held
    }

    /// Add (or refresh) a target. New targets start in the unassigned pool.
    pub fn add_instance(&self, target: Target) {
        let mut state = self.state.lock();
        let id = target.id.clone();
        state.targets.insert(id.clone(), target);
        if !state.owners.contains_key(&id) {
            state.unassigned.insert(id.clone());
        }
        state.notify(ChangeNotification::TargetAdded(id));
    }

    /// Remove a target, returning it and the flask that was monitoring it (so
    /// the caller can instruct that flask to drop the work).
    pub fn remove_instance(&self, id: &TargetId) -> Option<(Target, Option<FlaskId>)> {
        let mut state = self.state.lock();
        let target = state.targets.remove(id)?;
        let owner = state.owners.get(id).cloned();
        state.detach_target(id);
        state.notify(ChangeNotification::TargetRemoved(id.clone()));
        Some((target, owner))
    }

    /// The current assignment of `flask`.
    pub fn assigned_targets(&self, flask: &FlaskId) -> BTreeSet<TargetId> {
        self.state
            .lock()
            .assignments
            .get(flask)
            .cloned()
            .unwrap_or_default()
    }

    /// Atomically replace the assignments of every flask listed in `delta`.
    ///
    /// Targets moving between flasks are removed from their prior owner in
    /// the same step, so no observer ever sees a target under two flasks.
    /// Targets no longer in the fleet are skipped with a warning. Applying
    /// the same delta twice is a no-op the second time.
    pub fn merge_distribution(&self, delta: Distribution) -> Result<(), Error> {
        let mut state = self.state.lock();

        for (flask, _) in delta.iter() {
            match state.flasks.get(flask) {
                Some(f) if f.assignable() => {}
                _ => return NotAssignableSnafu { id: flask.clone() }.fail(),
            }
        }

        let mut changed = false;
        for (flask, wanted) in delta {
            let wanted: BTreeSet<TargetId> = wanted
                .into_iter()
                .filter(|t| {
                    let known = state.targets.contains_key(t);
                    if !known {
                        warn!(target=%t, flask=%flask, "dropping unknown target from distribution");
                    }
                    known
                })
                .collect();

            let prior = state.assignments.get(&flask).cloned().unwrap_or_default();
            if prior == wanted {
                continue;
            }
            changed = true;

            // Targets this flask is losing without a new owner in the delta
            // fall back into the unassigned pool.
            for dropped in prior.difference(&wanted) {
                state.owners.remove(dropped);
                state.unassigned.insert(dropped.clone());
            }

            for target in &wanted {
                if let Some(prev) = state.owners.get(target).cloned() {
                    if prev != flask {
                        if let Some(held) = state.assignments.get_mut(&prev) {
                            held.remove(target);
                        }
                    }
                }
                state.owners.insert(target.clone(), flask.clone());
                state.unassigned.remove(target);
            }

            state.assignments.insert(flask, wanted);
        }

        if changed {
            state.notify(ChangeNotification::AssignmentChanged);
        }
        Ok(())
    }

    /// Update a flask's state, e.g. flipping it to Investigating and back.
    pub fn set_flask_state(&self, id: &FlaskId, new_state: FlaskState) {
        let mut state = self.state.lock();
        if let Some(flask) = state.flasks.get_mut(id) {
            if flask.state == new_state {
                return;
            }
            flask.state = new_state;
            state.notify(ChangeNotification::FlaskStateChanged(id.clone(), new_state));
        }
    }

    /// The flask record for `id`, if known.
    pub fn flask(&self, id: &FlaskId) -> Option<Flask> {
        self.state.lock().flasks.get(id).cloned()
    }

    /// All known flask records.
    pub fn flasks(&self) -> Vec<Flask> {
        self.state.lock().flasks.values().cloned().collect()
    }

    /// The target record for `id`, if known.
    pub fn target(&self, id: &TargetId) -> Option<Target> {
        self.state.lock().targets.get(id).cloned()
    }

    /// Targets awaiting capacity.
    pub fn unassigned(&self) -> BTreeSet<TargetId> {
        self.state.lock().unassigned.clone()
    }

    /// Append to the bounded lifecycle event ring.
    pub fn record_event(&self, event: Event) {
        let mut state = self.state.lock();
        state.events.push_back(event);
        while state.events.len() > MAX_RECENT_EVENTS {
            state.events.pop_front();
        }
    }

    /// The retained lifecycle events, oldest first.
    pub fn recent_events(&self) -> Vec<Event> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Record a telemetry key for `flask`; true iff it was not already known
    /// for this flask lifetime.
    pub fn record_key(&self, flask: &FlaskId, key: Key) -> bool {
        self.state
            .lock()
            .keys
            .entry(flask.clone())
            .or_default()
            .insert(key)
    }

    /// The keys currently known from `flask`.
    pub fn known_keys(&self, flask: &FlaskId) -> BTreeSet<Key> {
        self.state
            .lock()
            .keys
            .get(flask)
            .cloned()
            .unwrap_or_default()
    }

    /// The full current assignment, for operator inspection.
    pub fn shards(&self) -> BTreeMap<FlaskId, BTreeSet<TargetId>> {
        self.state.lock().assignments.clone()
    }

    /// A consistent copy of the placement-relevant state: eligible flasks
    /// with their assignments, plus target ownership.
    pub fn snapshot(&self) -> FleetSnapshot {
        let state = self.state.lock();
        let assignments = state
            .flasks
            .values()
            .filter(|f| f.eligible())
            .map(|f| {
                (
                    f.id.clone(),
                    state.assignments.get(&f.id).cloned().unwrap_or_default(),
                )
            })
            .collect();
        FleetSnapshot {
            assignments,
            owners: state.owners.clone(),
        }
    }
}
