//! End-to-end delivery: event store commit, namespaced outboxes, channel bus.
//!
//! Run with: cargo test --test outbox_flow --features test-utils

use std::sync::Arc;
use std::time::Duration;

use eventrelay::bus::{as_handler, BusConfig, ChannelBroker, ChannelEventBus, EventBus};
use eventrelay::namespace::{NamespaceOutbox, OutboxFactory};
use eventrelay::outbox::{EventOutbox, Outbox, OutboxConfig};
use eventrelay::storage::{EventStore, MemoryEventStore};
use eventrelay::test_utils::{assert_in_aggregate_order, make_event_for, RecordingHandler};
use eventrelay::{Context, Matcher};
use futures::future::BoxFuture;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

fn outbox_factory() -> OutboxFactory {
    Arc::new(
        |_namespace: String| -> BoxFuture<'static, eventrelay::outbox::Result<Arc<dyn Outbox>>> {
            Box::pin(async move {
                let config = OutboxConfig::default()
                    .with_sweep(Duration::from_millis(50), Duration::from_millis(50));
                Ok(Arc::new(EventOutbox::in_memory(config)) as Arc<dyn Outbox>)
            })
        },
    )
}

#[tokio::test]
async fn test_committed_events_reach_remote_subscribers_per_namespace() {
    let broker = Arc::new(ChannelBroker::new());
    let publisher: Arc<dyn EventBus> = Arc::new(
        ChannelEventBus::new(Arc::clone(&broker), BusConfig::default().with_topic("relay"))
            .unwrap(),
    );
    let subscriber: Arc<dyn EventBus> = Arc::new(
        ChannelEventBus::new(Arc::clone(&broker), BusConfig::default().with_topic("relay"))
            .unwrap(),
    );
    let projector = RecordingHandler::new("projector");
    subscriber
        .add_handler(&Context::new(), Matcher::All, projector.clone().into_arc())
        .await
        .unwrap();

    let outbox = Arc::new(NamespaceOutbox::new(outbox_factory()));
    outbox
        .add_handler(&Context::new(), Matcher::All, as_handler(Arc::clone(&publisher)))
        .await
        .unwrap();
    outbox.start();

    let store = MemoryEventStore::with_outbox(outbox.clone());
    let mut expected = 0;
    for namespace in ["ns1", "ns2"] {
        let ctx = Context::new().with_namespace(namespace);
        let id = Uuid::new_v4();
        let events: Vec<_> = (1..=3).map(|v| make_event_for("Step", id, v)).collect();
        expected += events.len();
        store.save(&ctx, events, 0).await.unwrap();
    }

    assert!(projector.wait_for(expected, TIMEOUT).await);
    assert_in_aggregate_order(&projector.events());

    let mut namespaces = projector.namespaces();
    namespaces.sort();
    namespaces.dedup();
    assert_eq!(namespaces, vec!["ns1".to_string(), "ns2".to_string()]);
    assert_eq!(outbox.namespaces(), vec!["ns1".to_string(), "ns2".to_string()]);

    outbox.close().await.unwrap();
    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_delivery_is_recovered_by_sweep() {
    // Fails first, standing in for a broker outage.
    let gateway = RecordingHandler::new("gateway");
    gateway.set_failing(true);

    let outbox = Arc::new(NamespaceOutbox::new(outbox_factory()));
    outbox
        .add_handler(&Context::new(), Matcher::All, gateway.clone().into_arc())
        .await
        .unwrap();
    outbox.start();

    let store = MemoryEventStore::with_outbox(outbox.clone());
    let ctx = Context::new().with_namespace("tenant");
    let id = Uuid::new_v4();
    store
        .save(&ctx, vec![make_event_for("Created", id, 1)], 0)
        .await
        .unwrap();

    let err = tokio::time::timeout(TIMEOUT, outbox.errors().recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err.namespace, "tenant");

    gateway.set_failing(false);
    assert!(gateway.wait_for(1, TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.count(), 1, "recovered entry must be delivered once");

    outbox.close().await.unwrap();
}
