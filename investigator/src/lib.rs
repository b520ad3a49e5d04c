//! Bounded-retry health probing of flasks suspected dead.
//!
//! Suspects arrive over a channel from the telemetry subscriber (error
//! frames) and the distribute sink (delivery failures). A suspect flask is
//! flipped to `Investigating` and probed with exponential backoff; recovery
//! flips it back to `Active` with the repository otherwise untouched, while
//! exhaustion of the retry budget synthesizes a Terminate event into the
//! lifecycle loop so confirmed losses reuse the normal rebalancing path.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use chemist_time::TimeProvider;
use data_types::{FlaskId, FlaskState, Location};
use flask_client::FlaskApi;
use lifecycle::codec::{CloudEvent, MessageKind};
use lifecycle::LifecycleHandle;
use metric::U64Counter;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use repository::Repository;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The ASG name stamped on synthesized Terminate events.
pub const SYNTHESIZED_ASG: &str = "chemist-investigator";

/// Knobs for the probing schedule.
#[derive(Debug, Clone)]
pub struct InvestigationConfig {
    /// Backoff between consecutive probes.
    pub backoff: BackoffConfig,
    /// Consecutive failed probes before a flask is declared lost.
    pub max_retries: usize,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_retries: 11,
        }
    }
}

/// Probes a flask's health endpoint.
#[async_trait]
pub trait Prober: std::fmt::Debug + Send + Sync + 'static {
    /// One probe; `Ok` means the flask is alive.
    async fn probe(&self, location: &Location) -> Result<(), flask_client::Error>;
}

/// Production [`Prober`] over the flask admin API.
#[derive(Debug)]
pub struct HealthProber {
    api: Arc<dyn FlaskApi>,
}

impl HealthProber {
    /// Probe through the given client.
    pub fn new(api: Arc<dyn FlaskApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Prober for HealthProber {
    async fn probe(&self, location: &Location) -> Result<(), flask_client::Error> {
        self.api.health(location).await
    }
}

/// Run the investigator until `shutdown` fires.
///
/// `suspects` carries flask ids implicated by telemetry errors or failed
/// deliveries. Duplicate reports for a flask already under investigation are
/// ignored.
pub async fn run_investigator(
    repo: Arc<Repository>,
    prober: Arc<dyn Prober>,
    lifecycle: LifecycleHandle,
    time_provider: Arc<dyn TimeProvider>,
    config: InvestigationConfig,
    mut suspects: mpsc::Receiver<FlaskId>,
    metrics: Arc<metric::Registry>,
    shutdown: CancellationToken,
) {
    let outcomes = metrics.register_metric::<U64Counter>(
        "chemist_investigations",
        "investigations finished, by outcome",
    );
    let recovered = outcomes.recorder(&[("outcome", "recovered")]);
    let lost = outcomes.recorder(&[("outcome", "confirmed_lost")]);

    let in_flight: Arc<Mutex<BTreeSet<FlaskId>>> = Default::default();

    loop {
        let suspect = tokio::select! {
            _ = shutdown.cancelled() => return,
            suspect = suspects.recv() => match suspect {
                Some(suspect) => suspect,
                None => return,
            },
        };

        if !in_flight.lock().insert(suspect.clone()) {
            debug!(flask=%suspect, "already under investigation");
            continue;
        }

        let flask = match repo.flask(&suspect) {
            Some(flask) if flask.state != FlaskState::Terminated => flask,
            _ => {
                debug!(flask=%suspect, "suspect unknown or already terminated");
                in_flight.lock().remove(&suspect);
                continue;
            }
        };

        info!(flask=%suspect, "starting investigation");
        repo.set_flask_state(&suspect, FlaskState::Investigating);

        let repo = Arc::clone(&repo);
        let prober = Arc::clone(&prober);
        let lifecycle = lifecycle.clone();
        let time_provider = Arc::clone(&time_provider);
        let config = config.clone();
        let in_flight = Arc::clone(&in_flight);
        let recovered = recovered.clone();
        let lost = lost.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = investigate_one(
                    repo,
                    prober,
                    lifecycle,
                    time_provider,
                    config,
                    flask.id.clone(),
                    flask.location,
                    recovered,
                    lost,
                ) => {}
            }
            in_flight.lock().remove(&flask.id);
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn investigate_one(
    repo: Arc<Repository>,
    prober: Arc<dyn Prober>,
    lifecycle: LifecycleHandle,
    time_provider: Arc<dyn TimeProvider>,
    config: InvestigationConfig,
    flask: FlaskId,
    location: Location,
    recovered: U64Counter,
    lost: U64Counter,
) {
    let mut backoff = Backoff::new(&config.backoff);
    let result = backoff
        .retry_all_errors("investigate", config.max_retries, || {
            prober.probe(&location)
        })
        .await;

    match result {
        Ok(()) => {
            info!(flask=%flask, "flask recovered, investigation closed");
            repo.set_flask_state(&flask, FlaskState::Active);
            recovered.inc(1);
        }
        Err(exhausted) => {
            warn!(
                flask=%flask,
                attempts = exhausted.attempts,
                error=%exhausted.source,
                "investigation exhausted, declaring flask lost"
            );
            lost.inc(1);
            lifecycle
                .submit(CloudEvent {
                    kind: MessageKind::Terminate,
                    asg: SYNTHESIZED_ASG.to_string(),
                    instance_id: flask.as_str().to_string(),
                    time: time_provider.now(),
                })
                .await;
        }
    }
}
