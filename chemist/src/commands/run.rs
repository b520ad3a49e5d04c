//! Implementation of the run command: bootstrap and wiring of the four
//! long-lived activities plus the admin HTTP server.
//!
//! The cloud-backed queue, resolver and telemetry transport implementations
//! are deployment-specific; the in-memory ones wired here drive a chemist
//! that manages the statically seeded fleet and everything submitted through
//! the admin API, which is also what local runs and the test suites use.

use backoff::BackoffConfig;
use chemist_time::SystemProvider;
use clap_blocks::investigation::InvestigationClapConfig;
use clap_blocks::run_config::RunConfig;
use clap_blocks::seeds::Seeds;
use data_types::ResourceTemplate;
use discovery::{InstanceResolver, MockResolver};
use flask_client::{FlaskApi, FlaskClient};
use investigator::{HealthProber, InvestigationConfig, Prober};
use lifecycle::{
    DistributeSink, EventQueue, FlaskDistributor, Interpreter, LifecycleHandle, MockEventQueue,
};
use observability_deps::tracing::{info, warn};
use repository::Repository;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{MockTransport, Transport};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::http::{self, AdminState};

/// How long in-flight work gets after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid admin address: {0}")]
    AdminAddr(#[from] std::net::AddrParseError),

    #[error("Invalid sharding strategy: {0}")]
    Sharding(#[from] sharder::Error),

    #[error("Cannot load seeds: {0}")]
    Seeds(#[from] clap_blocks::seeds::Error),

    #[error("Conflicting seed fleet: {0}")]
    Seeding(#[from] repository::Error),

    #[error("Admin server failed: {0}")]
    Http(#[from] hyper::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub struct Config {
    #[clap(flatten)]
    pub(crate) run_config: RunConfig,

    #[clap(flatten)]
    pub(crate) investigation: InvestigationClapConfig,
}

pub async fn command(config: Config) -> Result<()> {
    let addr = config.run_config.admin_addr()?;
    let sharder = config.run_config.sharder_type()?.build();

    let metrics = Arc::new(metric::Registry::new());
    let repo = Arc::new(Repository::new());
    let shutdown = CancellationToken::new();

    seed_fleet(&repo, &config.run_config)?;

    let templates: Vec<ResourceTemplate> = config
        .run_config
        .target_resource_templates
        .iter()
        .map(|t| ResourceTemplate::new(t.as_str()))
        .collect();

    let resolver = Arc::new(MockResolver::new()) as Arc<dyn InstanceResolver>;
    let queue = Arc::new(MockEventQueue::new()) as Arc<dyn EventQueue>;
    let transport = Arc::new(MockTransport::new()) as Arc<dyn Transport>;
    let api = Arc::new(FlaskClient::new(config.run_config.command_timeout)) as Arc<dyn FlaskApi>;

    let interpreter = Arc::new(Interpreter::new(
        Arc::clone(&repo),
        resolver,
        sharder,
        templates,
        config.run_config.funnel_port,
        &metrics,
    ));

    let (suspects_tx, suspects_rx) = mpsc::channel(1024);
    let sink = Arc::new(FlaskDistributor::new(
        Arc::clone(&repo),
        Arc::clone(&api),
        BackoffConfig::default(),
        config.run_config.distribute_workers,
        suspects_tx.clone(),
        &metrics,
    )) as Arc<dyn DistributeSink>;

    // initial placement of the seeded fleet
    let unassigned = repo.unassigned();
    if !unassigned.is_empty() {
        let distribution = interpreter.assign(unassigned);
        if let Err(e) = sink
            .apply(&lifecycle::Action::Redistributed(distribution))
            .await
        {
            warn!(error=%e, "seed distribution failed");
        }
    }

    // lifecycle loop
    let (handle, internal_rx) = LifecycleHandle::new();
    tokio::spawn(lifecycle::run_lifecycle(
        Arc::clone(&interpreter),
        queue,
        Arc::clone(&sink),
        internal_rx,
        shutdown.clone(),
    ));

    // telemetry subscriber; new keys are logged, errors implicate flasks
    let (key_tx, mut key_rx) = mpsc::channel(1024);
    let (error_tx, mut error_rx) = mpsc::channel(1024);
    tokio::spawn(telemetry::run_subscriber(
        Arc::clone(&repo),
        transport,
        key_tx,
        error_tx,
        Arc::clone(&metrics),
        shutdown.clone(),
    ));
    tokio::spawn(async move {
        while let Some(new_key) = key_rx.recv().await {
            info!(flask=%new_key.flask, key=%new_key.key.name, "new key discovered");
        }
    });
    tokio::spawn(async move {
        while let Some((flask, names)) = error_rx.recv().await {
            warn!(flask=%flask, kind=%names.kind, theirs=%names.theirs, "telemetry error reported");
            if suspects_tx.send(flask).await.is_err() {
                return;
            }
        }
    });

    // investigator
    let prober = Arc::new(HealthProber::new(api)) as Arc<dyn Prober>;
    tokio::spawn(investigator::run_investigator(
        Arc::clone(&repo),
        prober,
        handle,
        Arc::new(SystemProvider::new()),
        InvestigationConfig {
            backoff: config.investigation.backoff_config(),
            max_retries: config.investigation.max_investigating_retries,
        },
        suspects_rx,
        Arc::clone(&metrics),
        shutdown.clone(),
    ));

    let state = Arc::new(AdminState {
        repo,
        interpreter,
        sink,
        metrics,
    });

    info!(%addr, "chemist admin API listening");
    let server = http::serve(addr, state, shutdown.clone());
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            shutdown.cancel();
            // give in-flight work a grace period, then abandon it
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await;
        }
    }

    info!("chemist stopped");
    Ok(())
}

fn seed_fleet(repo: &Repository, run_config: &RunConfig) -> Result<()> {
    let seeds = match &run_config.seeds_file {
        Some(path) => Seeds::from_file(path)?,
        None => return Ok(()),
    };

    for flask in seeds.seed_flasks(run_config.funnel_port) {
        info!(flask=%flask.id, funnel=%flask.location.funnel_addr(), "seeding flask");
        repo.increase_capacity(flask)?;
    }
    for target in seeds.seed_targets() {
        info!(target=%target.id, "seeding target");
        repo.add_instance(target);
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error=%e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
