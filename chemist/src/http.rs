//! The admin HTTP API.
//!
//! Operator endpoints for inspecting and mutating the distribution:
//!
//! - `GET /health` - liveness
//! - `GET /shards` - current assignment per flask
//! - `GET /events` - the retained lifecycle events
//! - `GET /metrics` - process counters in exposition format
//! - `POST /distribute` - force placement of the unassigned pool

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use lifecycle::{Action, DistributeSink, Interpreter};
use observability_deps::tracing::{debug, warn};
use repository::Repository;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the admin routes need.
#[derive(Debug)]
pub struct AdminState {
    pub repo: Arc<Repository>,
    pub interpreter: Arc<Interpreter>,
    pub sink: Arc<dyn DistributeSink>,
    pub metrics: Arc<metric::Registry>,
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route(&state, req).await) }
            }))
        }
    });

    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn route(state: &AdminState, req: Request<Body>) -> Response<Body> {
    debug!(method=%req.method(), path=%req.uri().path(), "admin request");
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => text(StatusCode::OK, "OK"),
        (&Method::GET, "/shards") => shards(state),
        (&Method::GET, "/events") => events(state),
        (&Method::GET, "/metrics") => metrics(state),
        (&Method::POST, "/distribute") => distribute(state).await,
        _ => text(StatusCode::NOT_FOUND, "no such resource"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response is valid")
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .expect("serialized response is valid")
}

fn shards(state: &AdminState) -> Response<Body> {
    let assignments = state.repo.shards();
    let flasks = state.repo.flasks();

    let body: serde_json::Map<String, serde_json::Value> = flasks
        .into_iter()
        .map(|flask| {
            let targets: Vec<String> = assignments
                .get(&flask.id)
                .map(|held| held.iter().map(|t| t.to_string()).collect())
                .unwrap_or_default();
            (
                flask.id.to_string(),
                json!({
                    "state": flask.state.to_string(),
                    "host": flask.location.host,
                    "targets": targets,
                }),
            )
        })
        .collect();

    json_response(json!({
        "shards": body,
        "unassigned": state
            .repo
            .unassigned()
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>(),
    }))
}

fn events(state: &AdminState) -> Response<Body> {
    let events: Vec<serde_json::Value> = state
        .repo
        .recent_events()
        .iter()
        .map(|event| {
            json!({
                "kind": event.kind.to_string(),
                "asgName": event.asg,
                "instanceId": event.instance_id,
                "time": event.time.to_rfc3339(),
            })
        })
        .collect();
    json_response(json!({ "events": events }))
}

fn metrics(state: &AdminState) -> Response<Body> {
    let mut out = String::new();
    for (name, description, observations) in state.metrics.report() {
        out.push_str(&format!("# HELP {name} {description}\n"));
        for observation in observations {
            let attributes: Vec<String> = observation
                .attributes
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect();
            if attributes.is_empty() {
                out.push_str(&format!("{name} {}\n", observation.value));
            } else {
                out.push_str(&format!(
                    "{name}{{{}}} {}\n",
                    attributes.join(","),
                    observation.value
                ));
            }
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(out))
        .expect("serialized response is valid")
}

async fn distribute(state: &AdminState) -> Response<Body> {
    let unassigned = state.repo.unassigned();
    let distribution = state.interpreter.assign(unassigned);
    let resharded: usize = distribution.iter().map(|(_, targets)| targets.len()).sum();

    if let Err(e) = state.sink.apply(&Action::Redistributed(distribution)).await {
        warn!(error=%e, "forced distribute failed");
        return json_response(json!({ "resharded": resharded, "error": e.to_string() }));
    }
    json_response(json!({ "resharded": resharded }))
}
