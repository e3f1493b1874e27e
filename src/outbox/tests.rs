use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::middleware::ephemeral;
use crate::test_utils::{make_event, RecordingHandler};

fn fast_config() -> OutboxConfig {
    OutboxConfig::default().with_sweep(Duration::from_millis(50), Duration::from_millis(50))
}

/// Config for tests that drive sweeps by hand.
fn manual_config() -> OutboxConfig {
    OutboxConfig::default().with_sweep(Duration::from_secs(3600), Duration::ZERO)
}

async fn pending(outbox: &EventOutbox<MemoryOutboxStore>) -> usize {
    outbox.store().count(EntryState::Pending).await.unwrap()
}

#[test]
fn test_outbox_config_default() {
    let config = OutboxConfig::default();
    assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    assert_eq!(config.sweep_age(), Duration::from_secs(10));
    assert_eq!(config.claim_lease(), Duration::from_secs(60));
    assert_eq!(config.max_attempts, None);
}

#[tokio::test]
async fn test_oversized_sweep_durations_saturate() {
    let config = OutboxConfig::default().with_sweep(Duration::MAX, Duration::MAX);
    assert_eq!(config.sweep_interval_ms, u64::MAX);
    assert_eq!(config.sweep_age_ms, u64::MAX);

    let outbox = EventOutbox::in_memory(config);
    let handler = RecordingHandler::new("failing");
    handler.set_failing(true);
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();
    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();

    // Nothing is old enough to be retried.
    assert_eq!(outbox.sweep().await, 0);
    assert_eq!(pending(&outbox).await, 1);
}

#[tokio::test]
async fn test_enqueue_delivers_immediately() {
    let outbox = EventOutbox::in_memory(fast_config());
    let handler = RecordingHandler::new("immediate");
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();

    let event = make_event("Test", 1);
    outbox.enqueue(&Context::new(), event.clone()).await.unwrap();

    assert_eq!(handler.count(), 1);
    assert_eq!(handler.events()[0].as_ref(), &event);
    assert!(outbox.store().entries().await.is_empty());
}

#[tokio::test]
async fn test_enqueue_respects_matcher() {
    let outbox = EventOutbox::in_memory(fast_config());
    let handler = RecordingHandler::new("picky");
    outbox
        .add_handler(&Context::new(), Matcher::events(["Other"]), handler.clone().into_arc())
        .await
        .unwrap();

    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();

    assert_eq!(handler.count(), 0);
    assert!(outbox.store().entries().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_handler_rejected() {
    let outbox = EventOutbox::in_memory(fast_config());
    let ctx = Context::new();
    outbox
        .add_handler(&ctx, Matcher::All, RecordingHandler::new("dup").into_arc())
        .await
        .unwrap();

    let result = outbox
        .add_handler(&ctx, Matcher::All, RecordingHandler::new("dup").into_arc())
        .await;
    assert!(matches!(result, Err(OutboxError::HandlerAlreadyAdded(_))));
}

#[tokio::test]
async fn test_failed_delivery_is_redelivered_by_sweep() {
    let outbox = EventOutbox::in_memory(fast_config());
    let handler = RecordingHandler::new("recovering");
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();
    outbox.start();

    handler.set_failing(true);
    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();

    assert_eq!(handler.count(), 0);
    let err = outbox.errors().recv().await.unwrap();
    assert_eq!(err.namespace, crate::namespace::DEFAULT_NAMESPACE);
    assert_eq!(pending(&outbox).await, 1);

    handler.set_failing(false);
    assert!(handler.wait_for(1, Duration::from_secs(2)).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.count(), 1, "event must be delivered exactly once");
    assert!(outbox.store().entries().await.is_empty());

    outbox.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_added_after_enqueue_receives_on_sweep() {
    let outbox = EventOutbox::in_memory(manual_config());
    let failing = RecordingHandler::new("failing");
    failing.set_failing(true);
    outbox
        .add_handler(&Context::new(), Matcher::All, failing.clone().into_arc())
        .await
        .unwrap();

    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();

    let late = RecordingHandler::new("late");
    outbox
        .add_handler(&Context::new(), Matcher::All, late.clone().into_arc())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(outbox.sweep().await, 1);
    assert_eq!(late.count(), 1);
}

#[tokio::test]
async fn test_retry_skips_handlers_that_succeeded() {
    let outbox = EventOutbox::in_memory(manual_config());
    let ok = RecordingHandler::new("ok");
    let flaky = RecordingHandler::new("flaky");
    flaky.set_failing(true);

    let ctx = Context::new();
    outbox.add_handler(&ctx, Matcher::All, ok.clone().into_arc()).await.unwrap();
    outbox.add_handler(&ctx, Matcher::All, flaky.clone().into_arc()).await.unwrap();

    outbox.enqueue(&ctx, make_event("Test", 1)).await.unwrap();
    assert_eq!(ok.count(), 1);

    let entries = outbox.store().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 1);
    assert_eq!(entries[0].delivered_to, vec![HandlerType::new("ok")]);

    flaky.set_failing(false);
    tokio::time::sleep(Duration::from_millis(5)).await;
    outbox.sweep().await;

    assert_eq!(ok.count(), 1);
    assert_eq!(flaky.count(), 1);
    assert!(outbox.store().entries().await.is_empty());
}

#[tokio::test]
async fn test_ephemeral_handler_is_not_retried() {
    let outbox = EventOutbox::in_memory(manual_config());
    let inner = RecordingHandler::new("ephemeral");
    inner.set_failing(true);

    outbox
        .add_handler(&Context::new(), Matcher::All, ephemeral::middleware()(inner.clone().into_arc()))
        .await
        .unwrap();

    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();
    assert_eq!(inner.attempts(), 1);
    assert!(outbox.errors().try_recv().is_some());
    assert!(outbox.store().entries().await.is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(outbox.sweep().await, 0);
    assert_eq!(inner.attempts(), 1);
}

#[tokio::test]
async fn test_store_failure_is_returned_to_caller() {
    let outbox = EventOutbox::in_memory(fast_config());
    let handler = RecordingHandler::new("never");
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();

    outbox.store().set_fail_on_insert(true);
    let result = outbox.enqueue(&Context::new(), make_event("Test", 1)).await;

    assert!(matches!(result, Err(OutboxError::Store(_))));
    assert_eq!(handler.attempts(), 0);
}

#[tokio::test]
async fn test_dead_letter_after_max_attempts() {
    let outbox = EventOutbox::in_memory(manual_config().with_max_attempts(2));
    let handler = RecordingHandler::new("broken");
    handler.set_failing(true);
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();

    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(outbox.sweep().await, 1);

    assert_eq!(outbox.store().count(EntryState::Failed).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(outbox.sweep().await, 0);
    assert_eq!(handler.attempts(), 2);

    let errors = outbox.errors();
    let mut dead_lettered = 0;
    while let Some(err) = errors.try_recv() {
        if err.to_string().contains("failed permanently") {
            dead_lettered += 1;
        }
    }
    assert_eq!(dead_lettered, 1);
}

#[tokio::test]
async fn test_close_rejects_operations() {
    let outbox = EventOutbox::in_memory(fast_config());
    outbox.start();
    outbox.start();
    outbox.close().await.unwrap();

    let ctx = Context::new();
    assert!(matches!(
        outbox.enqueue(&ctx, make_event("Test", 1)).await,
        Err(OutboxError::Closed)
    ));
    assert!(matches!(
        outbox
            .add_handler(&ctx, Matcher::All, RecordingHandler::new("late").into_arc())
            .await,
        Err(OutboxError::Closed)
    ));
}

#[tokio::test]
async fn test_cancelled_context_rejects_enqueue() {
    let outbox = EventOutbox::in_memory(fast_config());
    let (ctx, cancel) = Context::new().with_cancel();
    cancel.cancel();

    let result = outbox.enqueue(&ctx, make_event("Test", 1)).await;
    assert!(matches!(result, Err(OutboxError::Cancelled(_))));
}

/// Store whose inserts land before a slow acknowledgement.
struct SlowInsertStore {
    inner: MemoryOutboxStore,
    delay: Duration,
}

#[async_trait]
impl OutboxStore for SlowInsertStore {
    async fn insert(&self, entry: &OutboxEntry) -> std::result::Result<(), StoreError> {
        self.inner.insert(entry).await?;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn claim_stale(&self, query: &ClaimQuery) -> std::result::Result<Vec<OutboxEntry>, StoreError> {
        self.inner.claim_stale(query).await
    }

    async fn release(
        &self,
        entry: &OutboxEntry,
        claimed_at: chrono::DateTime<chrono::Utc>,
    ) -> std::result::Result<(), StoreError> {
        self.inner.release(entry, claimed_at).await
    }

    async fn get(&self, id: uuid::Uuid) -> std::result::Result<Option<OutboxEntry>, StoreError> {
        self.inner.get(id).await
    }

    async fn count(&self, state: EntryState) -> std::result::Result<usize, StoreError> {
        self.inner.count(state).await
    }
}

#[tokio::test]
async fn test_deadline_after_insert_leaves_entry_pending() {
    let store = Arc::new(SlowInsertStore {
        inner: MemoryOutboxStore::new(),
        delay: Duration::from_millis(200),
    });
    let outbox = EventOutbox::new(Arc::clone(&store), manual_config());
    let handler = RecordingHandler::new("later");
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();

    let ctx = Context::new().with_timeout(Duration::from_millis(20));
    let result = outbox.enqueue(&ctx, make_event("Test", 1)).await;

    assert!(matches!(
        result,
        Err(OutboxError::Cancelled(Cancelled::DeadlineExceeded))
    ));
    assert_eq!(handler.attempts(), 0);
    assert_eq!(store.count(EntryState::InFlight).await.unwrap(), 0);
    assert_eq!(store.count(EntryState::Pending).await.unwrap(), 1);

    // The next sweep delivers without waiting for the claim lease.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(outbox.sweep().await, 1);
    assert_eq!(handler.count(), 1);
}

#[tokio::test]
async fn test_sweep_does_not_steal_in_flight_entry() {
    let config = OutboxConfig::default().with_sweep(Duration::from_millis(10), Duration::from_millis(10));
    let outbox = EventOutbox::in_memory(config);
    let handler = RecordingHandler::new("slow");
    handler.set_delay(Duration::from_millis(300));
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();
    outbox.start();

    outbox.enqueue(&Context::new(), make_event("Test", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.attempts(), 1);
    assert!(outbox.store().entries().await.is_empty());
    outbox.close().await.unwrap();
}

#[tokio::test]
async fn test_lease_expiry_during_delivery_rejects_stale_release() {
    let mut config = manual_config();
    config.claim_lease_ms = 20;
    let outbox = Arc::new(EventOutbox::in_memory(config));

    let fast = RecordingHandler::new("fast");
    let slow = RecordingHandler::new("slow");
    slow.set_delay(Duration::from_millis(200));
    let broken = RecordingHandler::new("broken");
    broken.set_failing(true);
    for handler in [&fast, &slow, &broken] {
        outbox
            .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
            .await
            .unwrap();
    }

    let enqueuing = {
        let outbox = Arc::clone(&outbox);
        tokio::spawn(async move { outbox.enqueue(&Context::new(), make_event("Test", 1)).await })
    };

    // The immediate delivery is inside the slow handler and its lease has
    // run out, so the sweep takes the entry over.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(outbox.sweep().await, 1);
    enqueuing.await.unwrap().unwrap();

    let entries = outbox.store().entries().await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.state, EntryState::Pending);
    assert_eq!(
        entry.delivered_to,
        vec![HandlerType::new("fast"), HandlerType::new("slow")]
    );
    assert_eq!(entry.attempts, 1);

    let errors = outbox.errors();
    let mut claim_lost = 0;
    while let Some(err) = errors.try_recv() {
        if let Some(OutboxError::Store(StoreError::ClaimLost(id))) =
            err.source.downcast_ref::<OutboxError>()
        {
            assert_eq!(*id, entry.id);
            claim_lost += 1;
        }
    }
    assert_eq!(claim_lost, 1, "only the superseded delivery loses its claim");
}

#[tokio::test]
async fn test_abandoned_claim_is_recovered_after_lease() {
    let store = Arc::new(MemoryOutboxStore::new());
    let mut config = manual_config();
    config.claim_lease_ms = 0;

    // An entry left in flight by a process that died mid-delivery.
    let abandoned = OutboxEntry::new("default", make_event("Test", 1), chrono::Utc::now());
    store.insert(&abandoned).await.unwrap();

    let outbox = EventOutbox::new(Arc::clone(&store), config);
    let handler = RecordingHandler::new("recovery");
    outbox
        .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(outbox.sweep().await, 1);
    assert_eq!(handler.count(), 1);
    assert!(store.get(abandoned.id).await.unwrap().is_none());
}
