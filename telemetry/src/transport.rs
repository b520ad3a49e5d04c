//! Transport over which flasks publish telemetry.
//!
//! Production deployments subscribe to each flask's PUB socket on the funnel
//! port; that implementation ships with the deployment. This module fixes the
//! contract and provides the in-memory transport used by tests and local
//! runs. A subscription yields raw multipart frames; decoding happens in the
//! subscriber so that malformed frames can be dropped without tearing the
//! connection down.

use async_trait::async_trait;
use bytes::Bytes;
use data_types::Location;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Transport errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The subscription socket could not be opened.
    #[snafu(display("cannot subscribe to {}: {}", endpoint, reason))]
    SubscribeFailed {
        /// The endpoint that refused us.
        endpoint: String,
        /// Why.
        reason: String,
    },
}

/// One open subscription to a single flask's telemetry stream.
#[async_trait]
pub trait Subscription: std::fmt::Debug + Send {
    /// The stream of multipart frames. Pending while the flask is silent;
    /// ends when the peer goes away or the subscription is dropped.
    async fn stream(&mut self) -> BoxStream<'static, Result<Vec<Bytes>, Error>>;
}

/// Produces [`Subscription`]s for flask locations.
#[async_trait]
pub trait Transport: std::fmt::Debug + Send + Sync + 'static {
    /// Open a subscription to the flask at `location`.
    ///
    /// Implementations dial the flask's telemetry endpoint,
    /// [`Location::funnel_addr`], not the admin port.
    async fn subscribe(&self, location: &Location) -> Result<Box<dyn Subscription>, Error>;
}

type Feed = mpsc::UnboundedSender<Result<Vec<Bytes>, Error>>;

/// An in-memory [`Transport`] with per-host scripted feeds.
#[derive(Debug, Default)]
pub struct MockTransport {
    feeds: Arc<Mutex<BTreeMap<String, Vec<Feed>>>>,
}

impl MockTransport {
    /// Create a transport with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a frame to every open subscription for `host`.
    pub fn publish(&self, host: &str, parts: Vec<Bytes>) {
        let mut feeds = self.feeds.lock();
        if let Some(subscribers) = feeds.get_mut(host) {
            subscribers.retain(|tx| tx.send(Ok(parts.clone())).is_ok());
        }
    }

    /// Number of currently open subscriptions for `host`.
    pub fn subscriber_count(&self, host: &str) -> usize {
        let mut feeds = self.feeds.lock();
        match feeds.get_mut(host) {
            Some(subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, location: &Location) -> Result<Box<dyn Subscription>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .entry(location.host.clone())
            .or_default()
            .push(tx);
        Ok(Box::new(MockSubscription { rx: Some(rx) }))
    }
}

#[derive(Debug)]
struct MockSubscription {
    rx: Option<mpsc::UnboundedReceiver<Result<Vec<Bytes>, Error>>>,
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn stream(&mut self) -> BoxStream<'static, Result<Vec<Bytes>, Error>> {
        let rx = self.rx.take().expect("stream requested twice");
        UnboundedReceiverStream::new(rx).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(host: &str) -> Location {
        Location {
            host: host.into(),
            port: 7390,
            funnel_port: 7390,
            protocol: "http".into(),
            datacenter: "local".into(),
            intent: "mirroring".into(),
            templates: vec![],
        }
    }

    #[tokio::test]
    async fn frames_reach_only_matching_hosts() {
        let transport = MockTransport::new();
        let mut f1 = transport.subscribe(&location("f1")).await.unwrap();
        let mut f2 = transport.subscribe(&location("f2")).await.unwrap();

        transport.publish("f1", vec![Bytes::from_static(b"hello")]);

        let mut s1 = f1.stream().await;
        let got = s1.next().await.unwrap().unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"hello")]);

        let mut s2 = f2.stream().await;
        tokio::select! {
            frame = s2.next() => panic!("unexpected frame: {frame:?}"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
        }
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_forgotten() {
        let transport = MockTransport::new();
        let sub = transport.subscribe(&location("f1")).await.unwrap();
        assert_eq!(transport.subscriber_count("f1"), 1);

        drop(sub);
        assert_eq!(transport.subscriber_count("f1"), 0);
    }
}
