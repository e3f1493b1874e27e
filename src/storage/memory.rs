//! In-memory event store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use super::{validate_batch, EventStore, EventStoreMaintenance, Result, StorageError};
use crate::context::Context;
use crate::event::{Event, EventType};
use crate::outbox::Outbox;

type StreamKey = (String, Uuid);

/// Event store keeping histories in memory, keyed by namespace and
/// aggregate id.
#[derive(Default)]
pub struct MemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<Arc<Event>>>>,
    outbox: Option<Arc<dyn Outbox>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue committed events to `outbox`.
    pub fn with_outbox(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            streams: RwLock::default(),
            outbox: Some(outbox),
        }
    }

    fn key(ctx: &Context, id: Uuid) -> StreamKey {
        (ctx.namespace().to_string(), id)
    }
}

fn ensure_live(ctx: &Context) -> Result<()> {
    ctx.check().map_err(StorageError::from)
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn save(&self, ctx: &Context, events: Vec<Event>, original_version: u64) -> Result<()> {
        ensure_live(ctx)?;
        let (_, id) = validate_batch(&events, original_version)?;

        {
            let mut streams = self.streams.write().await;
            let stream = streams.entry(Self::key(ctx, id)).or_default();
            let current = stream.last().map(|e| e.version()).unwrap_or(0);
            if current != original_version {
                return Err(StorageError::VersionConflict {
                    aggregate_id: id,
                    expected: original_version,
                    actual: current,
                });
            }
            stream.extend(events.iter().cloned().map(Arc::new));
        }

        debug!(
            namespace = %ctx.namespace(),
            aggregate_id = %id,
            count = events.len(),
            "Events committed"
        );

        let Some(outbox) = &self.outbox else {
            return Ok(());
        };

        // Every committed event gets its own enqueue attempt.
        let total = events.len();
        let mut failures = Vec::new();
        for event in events {
            let version = event.version();
            if let Err(e) = outbox.enqueue(ctx, event).await {
                error!(aggregate_id = %id, version, error = %e, "Outbox hook failed after commit");
                failures.push(e);
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(source) => Err(StorageError::Outbox {
                failed,
                total,
                source,
            }),
        }
    }

    async fn load(&self, ctx: &Context, id: Uuid) -> Result<Vec<Arc<Event>>> {
        self.load_from(ctx, id, 0).await
    }

    async fn load_from(&self, ctx: &Context, id: Uuid, version: u64) -> Result<Vec<Arc<Event>>> {
        ensure_live(ctx)?;
        let streams = self.streams.read().await;
        Ok(streams
            .get(&Self::key(ctx, id))
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.version() >= version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventStoreMaintenance for MemoryEventStore {
    async fn replace(&self, ctx: &Context, event: Event) -> Result<()> {
        ensure_live(ctx)?;
        let id = event.aggregate_id();
        let version = event.version();

        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(&Self::key(ctx, id))
            .ok_or(StorageError::AggregateNotFound(id))?;
        let slot = stream
            .iter_mut()
            .find(|e| e.version() == version)
            .ok_or(StorageError::EventNotFound {
                aggregate_id: id,
                version,
            })?;
        *slot = Arc::new(event);
        Ok(())
    }

    async fn rename_event(&self, ctx: &Context, from: &EventType, to: &EventType) -> Result<()> {
        ensure_live(ctx)?;
        let namespace = ctx.namespace();

        let mut renamed = 0usize;
        let mut streams = self.streams.write().await;
        for ((ns, _), stream) in streams.iter_mut() {
            if ns != namespace {
                continue;
            }
            for event in stream.iter_mut().filter(|e| e.event_type() == from) {
                *event = Arc::new(event.renamed(to.clone()));
                renamed += 1;
            }
        }

        debug!(namespace = %namespace, from = %from, to = %to, renamed, "Renamed event type");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::context::Cancelled;
    use crate::matcher::Matcher;
    use crate::outbox::{EventOutbox, OutboxConfig};
    use crate::test_utils::{make_event_for, RecordingHandler};

    fn history(id: Uuid, types: &[&str]) -> Vec<Event> {
        types
            .iter()
            .enumerate()
            .map(|(i, t)| make_event_for(t, id, i as u64 + 1))
            .collect()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryEventStore::new();
        let ctx = Context::new();
        let id = Uuid::new_v4();
        let events = history(id, &["Created", "Renamed", "Closed"]);

        store.save(&ctx, events.clone(), 0).await.unwrap();

        let loaded = store.load(&ctx, id).await.unwrap();
        let loaded: Vec<Event> = loaded.iter().map(|e| (**e).clone()).collect();
        assert_eq!(loaded, events);

        let tail = store.load_from(&ctx, id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflicts() {
        let store = MemoryEventStore::new();
        let ctx = Context::new();
        let id = Uuid::new_v4();
        store.save(&ctx, history(id, &["Created"]), 0).await.unwrap();

        let result = store
            .save(&ctx, vec![make_event_for("Stale", id, 1)], 0)
            .await;
        assert!(matches!(
            result,
            Err(StorageError::VersionConflict { expected: 0, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_histories_scoped_by_namespace() {
        let store = MemoryEventStore::new();
        let id = Uuid::new_v4();
        let tenant_a = Context::new().with_namespace("a");
        let tenant_b = Context::new().with_namespace("b");

        store.save(&tenant_a, history(id, &["Created"]), 0).await.unwrap();

        assert!(store.load(&tenant_b, id).await.unwrap().is_empty());
        // The same aggregate id starts fresh in another namespace.
        store.save(&tenant_b, history(id, &["Created"]), 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_event() {
        let store = MemoryEventStore::new();
        let ctx = Context::new();
        let id = Uuid::new_v4();
        store.save(&ctx, history(id, &["Created", "Updated"]), 0).await.unwrap();

        let replacement = crate::event::Event::new(
            "Updated",
            serde_json::json!({ "content": "corrected" }),
            crate::event::AggregateRef::new(crate::test_utils::TEST_AGGREGATE, id, 2),
        );
        store.replace(&ctx, replacement.clone()).await.unwrap();

        let loaded = store.load(&ctx, id).await.unwrap();
        assert_eq!(loaded[1].as_ref(), &replacement);
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_replace_missing_aggregate_or_version() {
        let store = MemoryEventStore::new();
        let ctx = Context::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            store.replace(&ctx, make_event_for("Created", id, 1)).await,
            Err(StorageError::AggregateNotFound(missing)) if missing == id
        ));

        store.save(&ctx, history(id, &["Created"]), 0).await.unwrap();
        assert!(matches!(
            store.replace(&ctx, make_event_for("Created", id, 5)).await,
            Err(StorageError::EventNotFound { version: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_event_within_namespace() {
        let store = MemoryEventStore::new();
        let ctx = Context::new();
        let other = Context::new().with_namespace("other");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.save(&ctx, history(first, &["Old", "Kept", "Old"]), 0).await.unwrap();
        store.save(&ctx, history(second, &["Old"]), 0).await.unwrap();
        store.save(&other, history(first, &["Old"]), 0).await.unwrap();

        store
            .rename_event(&ctx, &EventType::new("Old"), &EventType::new("New"))
            .await
            .unwrap();

        let types = |events: Vec<Arc<Event>>| -> Vec<String> {
            events.iter().map(|e| e.event_type().to_string()).collect()
        };
        assert_eq!(types(store.load(&ctx, first).await.unwrap()), ["New", "Kept", "New"]);
        assert_eq!(types(store.load(&ctx, second).await.unwrap()), ["New"]);
        assert_eq!(types(store.load(&other, first).await.unwrap()), ["Old"]);
    }

    #[tokio::test]
    async fn test_save_enqueues_to_outbox_after_commit() {
        let outbox = Arc::new(EventOutbox::in_memory(OutboxConfig::default()));
        let handler = RecordingHandler::new("projector");
        outbox
            .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
            .await
            .unwrap();

        let store = MemoryEventStore::with_outbox(outbox);
        let ctx = Context::new().with_namespace("tenant");
        let id = Uuid::new_v4();
        store.save(&ctx, history(id, &["Created", "Updated"]), 0).await.unwrap();

        assert!(handler.wait_for(2, Duration::from_secs(1)).await);
        let versions: Vec<u64> = handler.events().iter().map(|e| e.version()).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(handler.namespaces(), vec!["tenant".to_string(); 2]);
    }

    #[tokio::test]
    async fn test_rejected_save_never_reaches_outbox() {
        let outbox = Arc::new(EventOutbox::in_memory(OutboxConfig::default()));
        let handler = RecordingHandler::new("projector");
        outbox
            .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
            .await
            .unwrap();
        let store = MemoryEventStore::with_outbox(outbox.clone());

        let result = store
            .save(&Context::new(), vec![make_event_for("Created", Uuid::new_v4(), 2)], 0)
            .await;

        assert!(matches!(result, Err(StorageError::InvalidVersion { .. })));
        assert_eq!(handler.attempts(), 0);
        assert!(outbox.store().entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_outbox_reported_after_commit() {
        let outbox = Arc::new(EventOutbox::in_memory(OutboxConfig::default()));
        outbox.close().await.unwrap();
        let store = MemoryEventStore::with_outbox(outbox);
        let ctx = Context::new();
        let id = Uuid::new_v4();

        let result = store.save(&ctx, history(id, &["Created"]), 0).await;

        assert!(matches!(
            result,
            Err(StorageError::Outbox { failed: 1, total: 1, .. })
        ));
        assert_eq!(store.load(&ctx, id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_enqueue_does_not_skip_rest_of_batch() {
        let outbox = Arc::new(EventOutbox::in_memory(OutboxConfig::default()));
        let handler = RecordingHandler::new("projector");
        outbox
            .add_handler(&Context::new(), Matcher::All, handler.clone().into_arc())
            .await
            .unwrap();
        outbox.store().fail_nth_insert(2);
        let store = MemoryEventStore::with_outbox(outbox.clone());
        let ctx = Context::new();
        let id = Uuid::new_v4();

        let result = store
            .save(&ctx, history(id, &["Created", "Updated", "Closed"]), 0)
            .await;

        assert!(matches!(
            result,
            Err(StorageError::Outbox { failed: 1, total: 3, .. })
        ));
        assert_eq!(store.load(&ctx, id).await.unwrap().len(), 3);
        let versions: Vec<u64> = handler.events().iter().map(|e| e.version()).collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_expired_deadline_reported_as_such() {
        let store = MemoryEventStore::new();
        let ctx = Context::new().with_deadline(tokio::time::Instant::now());

        let result = store.load(&ctx, Uuid::new_v4()).await;

        assert!(matches!(
            result,
            Err(StorageError::Cancelled(Cancelled::DeadlineExceeded))
        ));
    }
}
