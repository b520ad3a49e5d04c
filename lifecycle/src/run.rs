//! The supervised lifecycle loop.
//!
//! One worker blocks on the cloud event queue and processes messages in
//! order of receipt. A bounded internal channel carries synthesized events
//! (the investigator's confirmed-loss terminates) into the same
//! interpret-then-distribute path. No error terminates the loop; everything
//! is logged and the next message is processed.

use crate::codec::{self, CloudEvent};
use crate::interpreter::Interpreter;
use crate::queue::{EventQueue, QueueMessage};
use crate::sink::DistributeSink;
use observability_deps::tracing::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the synthesized-event channel.
const HANDLE_CAPACITY: usize = 1024;

/// How long to pause the receive loop after a queue error.
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// A clonable submit handle into the lifecycle loop.
///
/// Events submitted here take the same interpret-and-distribute path as
/// cloud messages, which is how the investigator reuses the rebalancing
/// logic for confirmed losses.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<CloudEvent>,
}

impl LifecycleHandle {
    /// Create a handle and the receiver end the run loop consumes.
    pub fn new() -> (Self, mpsc::Receiver<CloudEvent>) {
        let (tx, rx) = mpsc::channel(HANDLE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Submit a synthesized event.
    pub async fn submit(&self, event: CloudEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("lifecycle loop gone, synthesized event dropped");
        }
    }
}

/// Run the lifecycle loop until `shutdown` fires.
pub async fn run_lifecycle(
    interpreter: Arc<Interpreter>,
    queue: Arc<dyn EventQueue>,
    sink: Arc<dyn DistributeSink>,
    mut internal: mpsc::Receiver<CloudEvent>,
    shutdown: CancellationToken,
) {
    info!("lifecycle loop started");
    let mut internal_open = true;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("lifecycle loop shutdown");
                return;
            }
            event = internal.recv(), if internal_open => {
                match event {
                    Some(event) => process(&interpreter, &sink, &event).await,
                    // every handle dropped; cloud messages keep flowing
                    None => internal_open = false,
                }
            }
            received = queue.receive() => {
                let messages = match received {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(error=%e, "event queue receive failed");
                        tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                        continue;
                    }
                };
                for message in messages {
                    if shutdown.is_cancelled() {
                        // leave the message undeleted; re-delivery is safe
                        info!("lifecycle loop shutdown");
                        return;
                    }
                    handle_message(&interpreter, &sink, &queue, message).await;
                }
            }
        }
    }
}

async fn handle_message(
    interpreter: &Interpreter,
    sink: &Arc<dyn DistributeSink>,
    queue: &Arc<dyn EventQueue>,
    message: QueueMessage,
) {
    match codec::parse(&message.body) {
        Ok(event) => {
            process(interpreter, sink, &event).await;
            // ack only after the action completed; a crash before this point
            // re-delivers the message, which is safe by idempotence
            if let Err(e) = queue.delete(&message).await {
                warn!(error=%e, "failed to acknowledge processed message");
            }
        }
        Err(e) => {
            // poison-pill avoidance: drop the message despite the error
            warn!(error=%e, body=%message.body, "unparseable event message, deleting");
            if let Err(e) = queue.delete(&message).await {
                warn!(error=%e, "failed to delete unparseable message");
            }
        }
    }
}

async fn process(interpreter: &Interpreter, sink: &Arc<dyn DistributeSink>, event: &CloudEvent) {
    let outcome = interpreter.handle_event(event).await;

    if let Err(e) = sink.apply(&outcome.action).await {
        error!(error=%e, "distribute failed");
    }
    for discard in &outcome.discards {
        if let Err(e) = sink.discard(discard).await {
            warn!(error=%e, host=%discard.location.host, "discard failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{Action, Discard};
    use crate::queue::MockEventQueue;
    use crate::sink;
    use async_trait::async_trait;
    use data_types::{FlaskId, Instance, ResourceTemplate, TargetId};
    use discovery::{InstanceResolver, MockResolver};
    use parking_lot::Mutex;
    use repository::Repository;
    use sharder::LeastLoaded;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct TestSink {
        actions: Mutex<Vec<Action>>,
        discards: Mutex<Vec<Discard>>,
    }

    #[async_trait]
    impl DistributeSink for TestSink {
        async fn apply(&self, action: &Action) -> Result<(), sink::Error> {
            self.actions.lock().push(action.clone());
            Ok(())
        }

        async fn discard(&self, discard: &Discard) -> Result<(), sink::Error> {
            self.discards.lock().push(discard.clone());
            Ok(())
        }
    }

    struct Fixture {
        repo: Arc<Repository>,
        resolver: Arc<MockResolver>,
        queue: Arc<MockEventQueue>,
        sink: Arc<TestSink>,
        handle: LifecycleHandle,
        shutdown: CancellationToken,
    }

    fn start() -> Fixture {
        test_helpers::maybe_start_logging();

        let repo = Arc::new(Repository::new());
        let resolver = Arc::new(MockResolver::new());
        let metrics = metric::Registry::new();
        let interpreter = Arc::new(Interpreter::new(
            Arc::clone(&repo),
            Arc::clone(&resolver) as Arc<dyn InstanceResolver>,
            Box::new(LeastLoaded),
            vec![ResourceTemplate::new("http://@host:@port/stream/previous")],
            7390,
            &metrics,
        ));
        let queue = Arc::new(MockEventQueue::new());
        let sink = Arc::new(TestSink::default());
        let (handle, internal) = LifecycleHandle::new();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_lifecycle(
            interpreter,
            Arc::clone(&queue) as Arc<dyn EventQueue>,
            Arc::clone(&sink) as Arc<dyn DistributeSink>,
            internal,
            shutdown.clone(),
        ));

        Fixture {
            repo,
            resolver,
            queue,
            sink,
            handle,
            shutdown,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn launch_body(id: &str) -> String {
        format!(
            r#"{{"kind":"Launch","asgName":"accounts-blue","instanceId":"{id}","time":"2020-04-07T11:36:04Z"}}"#
        )
    }

    fn terminate_body(id: &str) -> String {
        format!(
            r#"{{"kind":"Terminate","asgName":"accounts-blue","instanceId":"{id}","time":"2020-04-07T11:40:00Z"}}"#
        )
    }

    fn flask_instance(id: &str) -> Instance {
        Instance {
            id: id.into(),
            host: format!("{id}.local"),
            port: 5775,
            asg: "chemist-flasks".into(),
            tags: [("type".to_string(), "flask-mirror".to_string())].into(),
        }
    }

    fn target_instance(id: &str) -> Instance {
        Instance {
            id: id.into(),
            host: format!("{id}.local"),
            port: 1234,
            asg: "accounts-blue".into(),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn malformed_messages_are_deleted_without_mutation() {
        let f = start();

        f.queue.push("definitely { not json");
        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 1).await;

        assert!(f.repo.flasks().is_empty());
        assert!(f.repo.recent_events().is_empty());
        assert!(f.sink.actions.lock().is_empty());

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn messages_are_acked_after_their_action() {
        let f = start();
        f.resolver.register(flask_instance("f1"));
        f.resolver.register(target_instance("t1"));

        f.queue.push(launch_body("f1"));
        f.queue.push(launch_body("t1"));

        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 2).await;

        assert_eq!(
            f.repo.assigned_targets(&FlaskId::new("f1")),
            [TargetId::new("t1")].into()
        );
        // launch(f1) with nothing pending is a NoOp; launch(t1) redistributes
        let actions = f.sink.actions.lock().clone();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], Action::NoOp);
        assert!(matches!(&actions[1], Action::Redistributed(d) if !d.is_empty()));

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn flask_terminate_reshards_and_discard_reaches_owner() {
        let f = start();
        f.resolver.register(flask_instance("f1"));
        f.resolver.register(target_instance("t1"));

        f.queue.push(launch_body("f1"));
        f.queue.push(launch_body("t1"));
        f.queue.push(terminate_body("f1"));

        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 3).await;

        assert!(f.repo.assigned_targets(&FlaskId::new("f1")).is_empty());
        assert_eq!(f.repo.unassigned(), [TargetId::new("t1")].into());

        // now terminate the target; nobody owns it, so no discard goes out
        f.queue.push(terminate_body("t1"));
        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 4).await;
        assert!(f.sink.discards.lock().is_empty());

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn target_terminate_discards_from_the_owner() {
        let f = start();
        f.resolver.register(flask_instance("f1"));
        f.resolver.register(target_instance("t1"));

        f.queue.push(launch_body("f1"));
        f.queue.push(launch_body("t1"));
        f.queue.push(terminate_body("t1"));

        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 3).await;

        let discards = f.sink.discards.lock().clone();
        assert_eq!(discards.len(), 1);
        // the owning instance id, not the hostname
        assert_eq!(discards[0].flask, FlaskId::new("f1"));
        assert_eq!(discards[0].location.host, "f1.local");

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn synthesized_events_take_the_same_path() {
        let f = start();
        f.resolver.register(flask_instance("f1"));
        f.resolver.register(flask_instance("f2"));
        f.resolver.register(target_instance("t1"));

        f.queue.push(launch_body("f1"));
        f.queue.push(launch_body("t1"));
        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 2).await;

        f.queue.push(launch_body("f2"));
        let queue = Arc::clone(&f.queue);
        wait_until(move || queue.deleted().len() == 3).await;

        // the investigator would submit this on confirmed loss
        f.handle
            .submit(CloudEvent {
                kind: codec::MessageKind::Terminate,
                asg: "investigator".into(),
                instance_id: "f1".into(),
                time: chemist_time::Time::from_timestamp_nanos(0),
            })
            .await;

        let repo = Arc::clone(&f.repo);
        wait_until(move || {
            repo.flask(&FlaskId::new("f1"))
                .map(|flask| flask.state == data_types::FlaskState::Terminated)
                .unwrap_or(false)
        })
        .await;

        let repo = Arc::clone(&f.repo);
        wait_until(move || {
            repo.assigned_targets(&FlaskId::new("f2")) == [TargetId::new("t1")].into()
        })
        .await;

        f.shutdown.cancel();
    }
}
