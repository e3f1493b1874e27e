//! Test utilities and mock implementations.
//!
//! Provides a recording handler, event builders and the shared bus
//! acceptance suites used by unit tests and the broker integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::context::Context;
use crate::event::{AggregateRef, Event};
use crate::handler::{EventHandler, HandlerError, HandlerType};
use crate::matcher::Matcher;

/// Aggregate type used by test events.
pub const TEST_AGGREGATE: &str = "TestAggregate";

/// Build an event for a fresh aggregate.
pub fn make_event(event_type: &str, version: u64) -> Event {
    make_event_for(event_type, Uuid::new_v4(), version)
}

/// Build an event for a given aggregate id.
pub fn make_event_for(event_type: &str, aggregate_id: Uuid, version: u64) -> Event {
    Event::new(
        event_type,
        serde_json::json!({ "content": format!("event {version}") }),
        AggregateRef::new(TEST_AGGREGATE, aggregate_id, version),
    )
    .with_metadata("source", serde_json::json!("test"))
}

#[derive(Default)]
struct Recorded {
    events: Mutex<Vec<(String, Arc<Event>)>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    attempts: AtomicUsize,
    notify: Notify,
}

/// Handler that records what it receives and can be switched to failing.
#[derive(Clone)]
pub struct RecordingHandler {
    handler_type: HandlerType,
    recorded: Arc<Recorded>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Self {
        Self {
            handler_type: HandlerType::new(name),
            recorded: Arc::new(Recorded::default()),
        }
    }

    pub fn into_arc(self) -> Arc<dyn EventHandler> {
        Arc::new(self)
    }

    /// While failing, every call returns an error and nothing is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.recorded.failing.store(failing, Ordering::SeqCst);
    }

    /// Sleep for `delay` in every call before recording.
    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.recorded.delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Arc<Event>> {
        self.lock().iter().map(|(_, e)| Arc::clone(e)).collect()
    }

    /// Namespaces of the contexts the events were delivered with.
    pub fn namespaces(&self) -> Vec<String> {
        self.lock().iter().map(|(ns, _)| ns.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Number of calls, including failed ones.
    pub fn attempts(&self) -> usize {
        self.recorded.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` events were recorded.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.recorded.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Arc<Event>)>> {
        self.recorded
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventHandler for RecordingHandler {
    fn handler_type(&self) -> HandlerType {
        self.handler_type.clone()
    }

    fn handle(&self, ctx: Context, event: Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let this = self.clone();
        Box::pin(async move {
            this.recorded.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = this.recorded.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if this.recorded.failing.load(Ordering::SeqCst) {
                return Err(HandlerError::failed(this.handler_type.clone(), "handler disabled"));
            }
            this.lock().push((ctx.namespace().to_string(), event));
            this.recorded.notify.notify_waiters();
            Ok(())
        })
    }
}

/// Acceptance suite for two buses sharing one application id.
///
/// Handlers with the same type on both buses form one consumer group and
/// must divide the published events; a handler with another type must see
/// every event, unaltered, in per-aggregate version order. `settle` is
/// slept after subscribing, for brokers whose group membership is
/// established asynchronously.
pub async fn bus_acceptance(
    bus1: Arc<dyn EventBus>,
    bus2: Arc<dyn EventBus>,
    settle: Duration,
    timeout: Duration,
) {
    let ctx = Context::new();
    let shared_a = RecordingHandler::new("acceptance_shared");
    let shared_b = RecordingHandler::new("acceptance_shared");
    let other = RecordingHandler::new("acceptance_other");

    bus1.add_handler(&ctx, Matcher::All, shared_a.clone().into_arc())
        .await
        .expect("add handler to bus1");
    bus2.add_handler(&ctx, Matcher::All, shared_b.clone().into_arc())
        .await
        .expect("add handler to bus2");
    bus2.add_handler(&ctx, Matcher::All, other.clone().into_arc())
        .await
        .expect("add other handler to bus2");
    tokio::time::sleep(settle).await;

    let aggregates: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let mut published = Vec::new();
    for version in 1..=2 {
        for id in &aggregates {
            published.push(make_event_for("AcceptanceEvent", *id, version));
        }
    }
    for event in &published {
        bus1.publish(&ctx, Arc::new(event.clone()))
            .await
            .expect("publish");
    }

    assert!(
        other.wait_for(published.len(), timeout).await,
        "independent handler did not receive all events"
    );
    let received = other.events();
    for event in &published {
        assert!(
            received.iter().any(|r| r.as_ref() == event),
            "event {event} lost or altered in transit"
        );
    }
    assert_in_aggregate_order(&received);

    let deadline = tokio::time::Instant::now() + timeout;
    while shared_a.count() + shared_b.count() < published.len()
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        shared_a.count() + shared_b.count(),
        published.len(),
        "shared consumer group must receive each event exactly once"
    );
}

/// Acceptance suite for two buses with distinct application ids: each must
/// observe the full stream.
pub async fn fanout_acceptance(
    bus1: Arc<dyn EventBus>,
    bus2: Arc<dyn EventBus>,
    settle: Duration,
    timeout: Duration,
) {
    let ctx = Context::new();
    let first = RecordingHandler::new("fanout");
    let second = RecordingHandler::new("fanout");

    bus1.add_handler(&ctx, Matcher::All, first.clone().into_arc())
        .await
        .expect("add handler to bus1");
    bus2.add_handler(&ctx, Matcher::All, second.clone().into_arc())
        .await
        .expect("add handler to bus2");
    tokio::time::sleep(settle).await;

    let id = Uuid::new_v4();
    for version in 1..=3 {
        bus1.publish(&ctx, Arc::new(make_event_for("FanoutEvent", id, version)))
            .await
            .expect("publish");
    }

    assert!(first.wait_for(3, timeout).await, "first application missed events");
    assert!(second.wait_for(3, timeout).await, "second application missed events");
    assert_in_aggregate_order(&first.events());
    assert_in_aggregate_order(&second.events());
}

/// Assert versions are non-decreasing per aggregate.
pub fn assert_in_aggregate_order(events: &[Arc<Event>]) {
    let mut last: HashMap<Uuid, u64> = HashMap::new();
    for event in events {
        let previous = last.insert(event.aggregate_id(), event.version());
        if let Some(previous) = previous {
            assert!(
                previous <= event.version(),
                "aggregate {} delivered out of order: v{} after v{}",
                event.aggregate_id(),
                event.version(),
                previous
            );
        }
    }
}
