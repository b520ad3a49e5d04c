//! The fan-in over every live flask's telemetry stream.
//!
//! One reader task per Active flask. Readers are spawned and cancelled in
//! response to repository change notifications, so the subscription set
//! always tracks the fleet. Key frames are diffed against the repository's
//! per-flask known set; error frames are forwarded toward the investigator.

use crate::codec::{self, TOPIC_ERROR, TOPIC_KEY};
use crate::transport::Transport;
use bytes::Bytes;
use data_types::{FlaskId, Key, Location, Names};
use metric::U64Counter;
use observability_deps::tracing::{debug, info, warn};
use repository::{ChangeNotification, Repository};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use futures::StreamExt;

/// A key seen for the first time in a flask's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    /// The flask that reported it.
    pub flask: FlaskId,
    /// The key.
    pub key: Key,
}

/// Run the telemetry subscriber until `shutdown` fires.
///
/// `new_keys` receives each `(flask, key)` pair at most once per flask
/// lifetime; `errors` receives decoded error frames together with the flask
/// whose stream carried them.
pub async fn run_subscriber(
    repo: Arc<Repository>,
    transport: Arc<dyn Transport>,
    new_keys: mpsc::Sender<NewKey>,
    errors: mpsc::Sender<(FlaskId, Names)>,
    metrics: Arc<metric::Registry>,
    shutdown: CancellationToken,
) {
    let new_key_counter = metrics
        .register_metric::<U64Counter>(
            "chemist_new_keys",
            "metric keys newly discovered over telemetry",
        )
        .recorder(metric::Attributes::default());

    // Subscribe to changes before scanning so a flask launched during the
    // scan is not missed; the readers map suppresses the duplicate.
    let mut changes = repo.watch();
    let mut readers: BTreeMap<FlaskId, CancellationToken> = BTreeMap::new();

    for flask in repo.flasks() {
        if flask.eligible() {
            spawn_reader(
                &repo,
                &transport,
                &mut readers,
                flask.id,
                flask.location,
                &new_keys,
                &errors,
                &new_key_counter,
                &shutdown,
            );
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv() => {
                let change = match change {
                    Some(change) => change,
                    None => break,
                };
                match change {
                    ChangeNotification::FlaskAdded(id) => {
                        if let Some(flask) = repo.flask(&id) {
                            spawn_reader(
                                &repo,
                                &transport,
                                &mut readers,
                                id,
                                flask.location,
                                &new_keys,
                                &errors,
                                &new_key_counter,
                                &shutdown,
                            );
                        }
                    }
                    ChangeNotification::FlaskStateChanged(id, state) => {
                        if state == data_types::FlaskState::Terminated {
                            if let Some(token) = readers.remove(&id) {
                                info!(flask=%id, "closing telemetry subscription");
                                token.cancel();
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    for token in readers.into_values() {
        token.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_reader(
    repo: &Arc<Repository>,
    transport: &Arc<dyn Transport>,
    readers: &mut BTreeMap<FlaskId, CancellationToken>,
    id: FlaskId,
    location: Location,
    new_keys: &mpsc::Sender<NewKey>,
    errors: &mpsc::Sender<(FlaskId, Names)>,
    new_key_counter: &U64Counter,
    shutdown: &CancellationToken,
) {
    if readers.contains_key(&id) {
        return;
    }

    info!(flask=%id, funnel=%location.funnel_addr(), "opening telemetry subscription");
    let token = shutdown.child_token();
    readers.insert(id.clone(), token.clone());

    let repo = Arc::clone(repo);
    let transport = Arc::clone(transport);
    let new_keys = new_keys.clone();
    let errors = errors.clone();
    let new_key_counter = new_key_counter.clone();
    tokio::spawn(async move {
        read_loop(
            repo,
            transport,
            id,
            location,
            new_keys,
            errors,
            new_key_counter,
            token,
        )
        .await;
    });
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    repo: Arc<Repository>,
    transport: Arc<dyn Transport>,
    flask: FlaskId,
    location: Location,
    new_keys: mpsc::Sender<NewKey>,
    errors: mpsc::Sender<(FlaskId, Names)>,
    new_key_counter: U64Counter,
    token: CancellationToken,
) {
    let mut subscription = match transport.subscribe(&location).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(flask=%flask, error=%e, "telemetry subscription failed");
            return;
        }
    };
    let mut stream = subscription.stream().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            parts = stream.next() => {
                let parts = match parts {
                    None => {
                        debug!(flask=%flask, "telemetry stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(flask=%flask, error=%e, "telemetry stream failed");
                        break;
                    }
                    Some(Ok(parts)) => parts,
                };
                handle_frame(&repo, &flask, parts, &new_keys, &errors, &new_key_counter).await;
            }
        }
    }
}

async fn handle_frame(
    repo: &Repository,
    flask: &FlaskId,
    parts: Vec<Bytes>,
    new_keys: &mpsc::Sender<NewKey>,
    errors: &mpsc::Sender<(FlaskId, Names)>,
    new_key_counter: &U64Counter,
) {
    let frame = match codec::decode_frame(&parts) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(flask=%flask, error=%e, "dropping undecodable telemetry frame");
            return;
        }
    };

    match frame.topic.as_deref() {
        Some(TOPIC_KEY) => match codec::decode_key(&frame.payload) {
            Ok(key) => {
                if repo.record_key(flask, key.clone()) {
                    new_key_counter.inc(1);
                    debug!(flask=%flask, key=%key.name, "new telemetry key");
                    if new_keys
                        .send(NewKey {
                            flask: flask.clone(),
                            key,
                        })
                        .await
                        .is_err()
                    {
                        debug!("new-key receiver gone");
                    }
                }
            }
            Err(e) => warn!(flask=%flask, error=%e, "dropping undecodable key payload"),
        },
        Some(TOPIC_ERROR) => match codec::decode_names(&frame.payload) {
            Ok(names) => {
                if errors.send((flask.clone(), names)).await.is_err() {
                    debug!("error receiver gone");
                }
            }
            Err(e) => warn!(flask=%flask, error=%e, "dropping undecodable error payload"),
        },
        other => debug!(flask=%flask, topic=?other, "frame without routable topic"),
    }
}
