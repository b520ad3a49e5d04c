//! The distribute sink: pushing placement decisions out to the fleet.
//!
//! Actions flow from the interpreter into a [`DistributeSink`]. The
//! production sink fans each affected flask out over a bounded set of
//! concurrent deliveries, retries transient failures with jittered backoff,
//! and escalates a persistently unreachable flask to investigation.

use crate::interpreter::{Action, Discard};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use data_types::{Distribution, FlaskId, FlaskState, Location, Target};
use flask_client::FlaskApi;
use futures::{stream, StreamExt};
use metric::U64Counter;
use observability_deps::tracing::{debug, warn};
use repository::Repository;
use snafu::{ResultExt, Snafu};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Delivery failures surfaced to the run loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The flask refused the assignment outright; retrying cannot help.
    #[snafu(display("flask {} rejected an assignment: {}", flask, source))]
    AssignmentRejected {
        /// The refusing flask.
        flask: FlaskId,
        /// The 4xx failure.
        source: flask_client::Error,
    },

    /// The flask could not be reached within the retry budget; it has been
    /// handed to the investigator.
    #[snafu(display("flask {} unreachable after {} attempts", flask, attempts))]
    FlaskUnreachable {
        /// The unreachable flask.
        flask: FlaskId,
        /// How many deliveries were attempted.
        attempts: usize,
    },
}

/// Applies interpreter effects to the outside world.
#[async_trait]
pub trait DistributeSink: std::fmt::Debug + Send + Sync + 'static {
    /// Push an action's distribution to the affected flasks.
    async fn apply(&self, action: &Action) -> Result<(), Error>;

    /// Instruct a flask to stop monitoring targets.
    async fn discard(&self, discard: &Discard) -> Result<(), Error>;
}

/// Production [`DistributeSink`] over the flask admin API.
#[derive(Debug)]
pub struct FlaskDistributor {
    repo: Arc<Repository>,
    api: Arc<dyn FlaskApi>,
    backoff_config: BackoffConfig,
    max_attempts: usize,
    workers: usize,
    investigate: mpsc::Sender<FlaskId>,
    reshardings: U64Counter,
}

impl FlaskDistributor {
    /// How many deliveries may run at once by default.
    pub const DEFAULT_WORKERS: usize = 16;

    /// How often a delivery is attempted before the flask is suspect.
    pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

    /// Create a distributor.
    ///
    /// Flasks that exhaust the delivery retry budget are reported on
    /// `investigate` after being flipped to `Investigating`.
    pub fn new(
        repo: Arc<Repository>,
        api: Arc<dyn FlaskApi>,
        backoff_config: BackoffConfig,
        workers: usize,
        investigate: mpsc::Sender<FlaskId>,
        metrics: &metric::Registry,
    ) -> Self {
        let reshardings = metrics
            .register_metric::<U64Counter>("chemist_reshardings", "distribution deltas pushed out")
            .recorder(metric::Attributes::default());

        Self {
            repo,
            api,
            backoff_config,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            workers,
            investigate,
            reshardings,
        }
    }

    async fn distribute(&self, distribution: &Distribution) -> Result<(), Error> {
        if distribution.is_empty() {
            return Ok(());
        }
        self.reshardings.inc(1);

        let jobs: Vec<(FlaskId, Location, Vec<Target>)> = distribution
            .iter()
            .filter_map(|(flask_id, target_ids)| {
                let flask = match self.repo.flask(flask_id) {
                    Some(flask) => flask,
                    None => {
                        warn!(flask=%flask_id, "distribution references unknown flask");
                        return None;
                    }
                };
                let targets: Vec<Target> = target_ids
                    .iter()
                    .filter_map(|id| self.repo.target(id))
                    .collect();
                Some((flask_id.clone(), flask.location, targets))
            })
            .collect();

        let results: Vec<Result<(), Error>> = stream::iter(jobs)
            .map(|(flask, location, targets)| async move {
                self.deliver(flask, &location, &targets, DeliverVerb::Monitor)
                    .await
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        // every delivery ran to completion; surface the first failure
        results.into_iter().collect()
    }

    async fn deliver(
        &self,
        flask: FlaskId,
        location: &Location,
        targets: &[Target],
        verb: DeliverVerb,
    ) -> Result<(), Error> {
        let mut backoff = Backoff::new(&self.backoff_config);
        let attempted = backoff
            .retry_with_backoff(verb.as_str(), self.max_attempts, || async {
                let result = match verb {
                    DeliverVerb::Monitor => self.api.monitor(location, targets).await,
                    DeliverVerb::Discard => self.api.discard(location, targets).await,
                };
                match result {
                    Ok(()) => ControlFlow::Break(Ok(())),
                    Err(e) if e.is_retryable() => ControlFlow::Continue(e),
                    Err(e) => ControlFlow::Break(Err(e)),
                }
            })
            .await;

        match attempted {
            Ok(Ok(())) => {
                debug!(flask=%flask, verb=verb.as_str(), targets = targets.len(), "delivered");
                Ok(())
            }
            Ok(Err(source)) => Err(source).context(AssignmentRejectedSnafu { flask }),
            Err(exhausted) => {
                warn!(
                    flask=%flask,
                    attempts = exhausted.attempts,
                    error=%exhausted.source,
                    "flask unreachable, starting investigation"
                );
                self.repo.set_flask_state(&flask, FlaskState::Investigating);
                if self.investigate.send(flask.clone()).await.is_err() {
                    warn!(flask=%flask, "investigator gone, suspect flask unreported");
                }
                FlaskUnreachableSnafu {
                    flask,
                    attempts: exhausted.attempts,
                }
                .fail()
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DeliverVerb {
    Monitor,
    Discard,
}

impl DeliverVerb {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "distribute",
            Self::Discard => "discard",
        }
    }
}

#[async_trait]
impl DistributeSink for FlaskDistributor {
    async fn apply(&self, action: &Action) -> Result<(), Error> {
        match action {
            Action::NoOp => Ok(()),
            Action::Redistributed(distribution) => self.distribute(distribution).await,
        }
    }

    async fn discard(&self, discard: &Discard) -> Result<(), Error> {
        self.deliver(
            discard.flask.clone(),
            &discard.location,
            &discard.targets,
            DeliverVerb::Discard,
        )
        .await
    }
}
