//! A scriptable [`FlaskApi`](crate::FlaskApi) for tests.

use crate::{Error, FlaskApi, RejectedSnafu, ServerSnafu};
use async_trait::async_trait;
use data_types::{Location, Target, TargetId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `monitor` was invoked for the host with these targets.
    Monitor(String, BTreeSet<TargetId>),
    /// `discard` was invoked for the host with these targets.
    Discard(String, BTreeSet<TargetId>),
    /// `health` was probed for the host.
    Health(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Rejected,
    Server,
}

/// A [`FlaskApi`] that records calls and fails according to a per-host
/// script.
#[derive(Debug, Default)]
pub struct MockFlaskApi {
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<BTreeMap<String, Script>>,
    /// Per-host budget of failures before the host recovers; `None` fails
    /// forever while scripted.
    budgets: Mutex<BTreeMap<String, Option<usize>>>,
}

impl MockFlaskApi {
    /// Create a mock that succeeds for every host.
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Fail requests to `host` with a 4xx until further notice.
    pub fn reject(&self, host: &str) {
        self.scripts
            .lock()
            .insert(host.to_string(), Script::Rejected);
        self.budgets.lock().insert(host.to_string(), None);
    }

    /// Fail requests to `host` with a 5xx until further notice.
    pub fn fail(&self, host: &str) {
        self.scripts.lock().insert(host.to_string(), Script::Server);
        self.budgets.lock().insert(host.to_string(), None);
    }

    /// Fail the next `n` requests to `host` with a 5xx, then succeed.
    pub fn fail_times(&self, host: &str, n: usize) {
        self.scripts.lock().insert(host.to_string(), Script::Server);
        self.budgets.lock().insert(host.to_string(), Some(n));
    }

    /// Let requests to `host` succeed again.
    pub fn recover(&self, host: &str) {
        self.scripts.lock().remove(host);
        self.budgets.lock().remove(host);
    }

    fn outcome(&self, host: &str) -> Result<(), Error> {
        let script = {
            let scripts = self.scripts.lock();
            match scripts.get(host) {
                None => return Ok(()),
                Some(script) => *script,
            }
        };

        let budget_spent = {
            let mut budgets = self.budgets.lock();
            match budgets.get_mut(host) {
                Some(Some(remaining)) if *remaining == 0 => true,
                Some(Some(remaining)) => {
                    *remaining -= 1;
                    false
                }
                _ => false,
            }
        };
        if budget_spent {
            self.recover(host);
            return Ok(());
        }

        match script {
            Script::Rejected => RejectedSnafu { status: 400_u16 }.fail(),
            Script::Server => ServerSnafu { status: 503_u16 }.fail(),
        }
    }

    fn ids(targets: &[Target]) -> BTreeSet<TargetId> {
        targets.iter().map(|t| t.id.clone()).collect()
    }
}

#[async_trait]
impl FlaskApi for MockFlaskApi {
    async fn monitor(&self, location: &Location, targets: &[Target]) -> Result<(), Error> {
        self.calls
            .lock()
            .push(Call::Monitor(location.host.clone(), Self::ids(targets)));
        self.outcome(&location.host)
    }

    async fn discard(&self, location: &Location, targets: &[Target]) -> Result<(), Error> {
        self.calls
            .lock()
            .push(Call::Discard(location.host.clone(), Self::ids(targets)));
        self.outcome(&location.host)
    }

    async fn health(&self, location: &Location) -> Result<(), Error> {
        self.calls.lock().push(Call::Health(location.host.clone()));
        self.outcome(&location.host)
    }
}
