//! The cloud event queue contract.
//!
//! The production implementation wraps the cloud provider's queue service
//! (long-poll receive, explicit delete, at-least-once delivery) and ships
//! with the deployment; this module fixes the contract and provides the
//! in-memory queue used by tests and local runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Notify;

/// Generic boxed error type for queue implementations.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// implementations.
#[derive(Debug)]
pub struct QueueError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: QueueErrorKind,
}

impl QueueError {
    /// Wrap an error of the given kind.
    pub fn new(
        kind: QueueErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// An I/O failure talking to the queue service.
    pub fn io(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(QueueErrorKind::Io, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> QueueErrorKind {
        self.kind
    }
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for QueueError {}

/// Classification of a [`QueueError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueErrorKind {
    /// This operation failed for an unknown reason.
    Unknown,

    /// An I/O error occurred; the receive loop should retry.
    Io,
}

/// One message as received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque receipt handle used to delete the message.
    pub receipt: String,
    /// The raw message body.
    pub body: String,
}

/// A cloud event queue with at-least-once delivery.
///
/// Implementations must tolerate `delete` being called for a message that was
/// already deleted (re-delivery makes this unavoidable).
#[async_trait]
pub trait EventQueue: std::fmt::Debug + Send + Sync + 'static {
    /// Long-poll for the next batch of messages. Returns an empty batch on
    /// poll timeout.
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a message so it is not delivered again.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// An in-memory [`EventQueue`] for tests and local runs.
#[derive(Debug, Default)]
pub struct MockEventQueue {
    messages: Mutex<VecDeque<QueueMessage>>,
    deleted: Mutex<Vec<QueueMessage>>,
    notify: Arc<Notify>,
    sequence: Mutex<u64>,
}

impl MockEventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a raw message body onto the queue.
    pub fn push(&self, body: impl Into<String>) {
        let receipt = {
            let mut sequence = self.sequence.lock();
            *sequence += 1;
            format!("receipt-{}", sequence)
        };
        self.messages.lock().push_back(QueueMessage {
            receipt,
            body: body.into(),
        });
        self.notify.notify_one();
    }

    /// Messages acknowledged so far, in order.
    pub fn deleted(&self) -> Vec<QueueMessage> {
        self.deleted.lock().clone()
    }

    /// Number of messages neither delivered-and-deleted nor pending.
    pub fn pending(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl EventQueue for MockEventQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError> {
        loop {
            let batch: Vec<QueueMessage> = self.messages.lock().drain(..).collect();
            if !batch.is_empty() {
                return Ok(batch);
            }

            let notified = self.notify.notified();
            // re-check: a push may have raced the drain
            if !self.messages.lock().is_empty() {
                continue;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                    return Ok(vec![]);
                }
            }
        }
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.deleted.lock().push(message.clone());
        Ok(())
    }
}
