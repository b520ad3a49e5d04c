//! Client for the flask admin HTTP API.
//!
//! Chemist speaks three verbs to a flask: instruct it to mirror a set of
//! target streams, instruct it to discard them, and probe its health. The
//! [`FlaskApi`] trait is what the rest of the workspace programs against;
//! [`FlaskClient`] is the production implementation.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod mock;

use async_trait::async_trait;
use data_types::{Location, Target};
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use std::time::Duration;

/// Errors that occur while talking to a flask.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A transport-level failure: connect, DNS, timeout.
    #[snafu(display("error while processing request: {}", source))]
    ReqwestProcessing {
        /// The underlying reqwest error.
        source: reqwest::Error,
    },

    /// The flask refused the request; retrying cannot help.
    #[snafu(display("flask rejected the request: HTTP {}", status))]
    Rejected {
        /// The 4xx status code.
        status: u16,
    },

    /// The flask failed to serve the request; retry may help.
    #[snafu(display("flask server error: HTTP {}", status))]
    Server {
        /// The 5xx status code.
        status: u16,
    },
}

impl Error {
    /// True iff retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ReqwestProcessing { .. } | Self::Server { .. })
    }
}

/// The operations chemist performs against a flask.
#[async_trait]
pub trait FlaskApi: std::fmt::Debug + Send + Sync + 'static {
    /// Instruct the flask at `location` to begin monitoring `targets`.
    async fn monitor(&self, location: &Location, targets: &[Target]) -> Result<(), Error>;

    /// Instruct the flask at `location` to stop monitoring `targets`.
    async fn discard(&self, location: &Location, targets: &[Target]) -> Result<(), Error>;

    /// Probe the flask's health endpoint.
    async fn health(&self, location: &Location) -> Result<(), Error>;
}

/// Wire shape of one monitored bucket in a mirror/discard request.
#[derive(Debug, Serialize)]
struct MirrorRequest<'a> {
    bucket: &'a str,
    urls: Vec<&'a str>,
}

fn mirror_body(targets: &[Target]) -> Vec<MirrorRequest<'_>> {
    targets
        .iter()
        .map(|t| MirrorRequest {
            bucket: &t.cluster,
            urls: t.uris.iter().map(String::as_str).collect(),
        })
        .collect()
}

/// Production [`FlaskApi`] implementation over HTTP.
#[derive(Debug, Clone)]
pub struct FlaskClient {
    http: reqwest::Client,
}

impl FlaskClient {
    /// Create a client whose requests are bounded by `command_timeout`.
    pub fn new(command_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(command_timeout)
            .build()
            .expect("static client configuration is valid");
        Self { http }
    }

    fn check(response: reqwest::Response) -> Result<(), Error> {
        let status = response.status();
        if status.is_client_error() {
            return RejectedSnafu {
                status: status.as_u16(),
            }
            .fail();
        }
        if status.is_server_error() {
            return ServerSnafu {
                status: status.as_u16(),
            }
            .fail();
        }
        Ok(())
    }
}

#[async_trait]
impl FlaskApi for FlaskClient {
    async fn monitor(&self, location: &Location, targets: &[Target]) -> Result<(), Error> {
        let url = format!("{}/mirror", location.admin_base());
        let response = self
            .http
            .post(&url)
            .json(&mirror_body(targets))
            .send()
            .await
            .context(ReqwestProcessingSnafu)?;
        Self::check(response)
    }

    async fn discard(&self, location: &Location, targets: &[Target]) -> Result<(), Error> {
        let url = format!("{}/discard", location.admin_base());
        let response = self
            .http
            .post(&url)
            .json(&mirror_body(targets))
            .send()
            .await
            .context(ReqwestProcessingSnafu)?;
        Self::check(response)
    }

    async fn health(&self, location: &Location) -> Result<(), Error> {
        let url = format!("{}/health", location.admin_base());
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context(ReqwestProcessingSnafu)?;
        Self::check(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::TargetId;
    use mockito::mock;
    use once_cell::sync::Lazy;
    use parking_lot::Mutex;

    // the mockito server is global; tests registering overlapping routes
    // must not run concurrently
    static MOCKITO: Lazy<Mutex<()>> = Lazy::new(Default::default);

    fn mockito_location() -> Location {
        let url = mockito::server_url();
        let rest = url.strip_prefix("http://").unwrap();
        let (host, port) = rest.split_once(':').unwrap();
        Location {
            host: host.to_string(),
            port: port.parse().unwrap(),
            funnel_port: 7390,
            protocol: "http".to_string(),
            datacenter: "local".to_string(),
            intent: "mirroring".to_string(),
            templates: vec![],
        }
    }

    fn target() -> Target {
        Target {
            id: TargetId::new("i-target01"),
            cluster: "accounts-blue".into(),
            uris: ["http://10.0.0.2:1234/stream/previous".to_string()].into(),
        }
    }

    #[tokio::test]
    async fn monitor_posts_buckets_and_urls() {
        let _guard = MOCKITO.lock();
        let m = mock("POST", "/mirror")
            .match_header("content-type", "application/json")
            .match_body(
                r#"[{"bucket":"accounts-blue","urls":["http://10.0.0.2:1234/stream/previous"]}]"#,
            )
            .with_status(202)
            .create();

        let client = FlaskClient::new(Duration::from_secs(2));
        client
            .monitor(&mockito_location(), &[target()])
            .await
            .unwrap();

        m.assert();
    }

    #[tokio::test]
    async fn discard_posts_the_same_shape() {
        let _guard = MOCKITO.lock();
        let m = mock("POST", "/discard").with_status(200).create();

        let client = FlaskClient::new(Duration::from_secs(2));
        client
            .discard(&mockito_location(), &[target()])
            .await
            .unwrap();

        m.assert();
    }

    #[tokio::test]
    async fn client_errors_are_fatal() {
        let _guard = MOCKITO.lock();
        let _m = mock("POST", "/mirror").with_status(400).create();

        let client = FlaskClient::new(Duration::from_secs(2));
        let err = client
            .monitor(&mockito_location(), &[target()])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected { status: 400 }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let _guard = MOCKITO.lock();
        let _m = mock("GET", "/health").with_status(503).create();

        let client = FlaskClient::new(Duration::from_secs(2));
        let err = client.health(&mockito_location()).await.unwrap_err();

        assert!(matches!(err, Error::Server { status: 503 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_flasks_are_retryable() {
        let location = Location {
            host: "127.0.0.1".to_string(),
            // reserved port with nothing listening
            port: 1,
            funnel_port: 7390,
            protocol: "http".to_string(),
            datacenter: "local".to_string(),
            intent: "mirroring".to_string(),
            templates: vec![],
        };

        let client = FlaskClient::new(Duration::from_millis(250));
        let err = client.health(&location).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
