use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{
    ClaimQuery, EntryState, MemoryOutboxStore, Outbox, OutboxConfig, OutboxEntry, OutboxError,
    OutboxStore, Result, StoreError,
};
use crate::context::Context;
use crate::errors::{DeliveryError, ErrorChannel, ErrorReceiver};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerRegistry, HandlerType};
use crate::matcher::Matcher;
use crate::middleware;

/// [`Outbox`] over any [`OutboxStore`].
pub struct EventOutbox<S: OutboxStore> {
    inner: Arc<Inner<S>>,
    sweeper: Mutex<Option<SweepTask>>,
}

struct Inner<S> {
    store: Arc<S>,
    handlers: HandlerRegistry,
    config: OutboxConfig,
    errors: ErrorChannel,
    closed: AtomicBool,
}

/// Handle to the running sweep task.
struct SweepTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EventOutbox<MemoryOutboxStore> {
    /// Outbox backed by a fresh in-memory store.
    pub fn in_memory(config: OutboxConfig) -> Self {
        Self::new(Arc::new(MemoryOutboxStore::new()), config)
    }
}

impl<S: OutboxStore> EventOutbox<S> {
    pub fn new(store: Arc<S>, config: OutboxConfig) -> Self {
        let errors = ErrorChannel::new(config.error_channel_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                handlers: HandlerRegistry::new(),
                config,
                errors,
                closed: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.inner.config
    }

    /// Run one sweep cycle now. Returns the number of entries retried.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OutboxError::Closed);
        }
        Ok(())
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<SweepTask>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<S: OutboxStore> Outbox for EventOutbox<S> {
    async fn add_handler(
        &self,
        _ctx: &Context,
        matcher: Matcher,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.ensure_open()?;

        let handler_type = handler.handler_type();
        let ephemeral = middleware::is_ephemeral(handler.as_ref());
        if !self.inner.handlers.add(matcher, handler).await {
            return Err(OutboxError::HandlerAlreadyAdded(handler_type));
        }

        info!(handler = %handler_type, ephemeral, "Handler added to outbox");
        Ok(())
    }

    async fn remove_handler(&self, _ctx: &Context, handler_type: &HandlerType) -> Result<bool> {
        let removed = self.inner.handlers.remove(handler_type).await;
        if removed {
            info!(handler = %handler_type, "Handler removed from outbox");
        }
        Ok(removed)
    }

    #[tracing::instrument(name = "outbox.enqueue", skip_all, fields(namespace = %ctx.namespace(), event = %event))]
    async fn enqueue(&self, ctx: &Context, event: Event) -> Result<()> {
        self.ensure_open()?;

        let entry = OutboxEntry::new(ctx.namespace(), event, Utc::now());
        match ctx.guard(self.inner.store.insert(&entry)).await {
            Ok(inserted) => inserted?,
            Err(cancelled) => {
                self.inner.release_unattempted(&entry).await;
                return Err(cancelled.into());
            }
        }

        debug!(entry_id = %entry.id, "Event written to outbox");

        self.inner.deliver(entry, true).await;
        Ok(())
    }

    fn start(&self) {
        let mut sweeper = self.lock_sweeper();
        if sweeper.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_sweeper(cancel_rx).await });

        *sweeper = Some(SweepTask { cancel, handle });
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);

        let task = self.lock_sweeper().take();
        if let Some(task) = task {
            let _ = task.cancel.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Outbox sweep task ended abnormally");
            }
        }

        info!("Outbox closed");
        Ok(())
    }

    fn errors(&self) -> ErrorReceiver {
        self.inner.errors.receiver()
    }
}

impl<S: OutboxStore> Inner<S> {
    async fn run_sweeper(&self, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_ms = self.config.sweep_interval_ms,
            age_ms = self.config.sweep_age_ms,
            "Outbox sweep task started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("Outbox sweep task stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> usize {
        let now = Utc::now();
        let query = ClaimQuery {
            pending_before: cutoff(now, self.config.sweep_age()),
            lease_before: cutoff(now, self.config.claim_lease()),
            now,
            limit: self.config.sweep_batch_size,
        };

        let entries = match self.store.claim_stale(&query).await {
            Ok(entries) => entries,
            Err(e) => {
                self.errors
                    .report(DeliveryError::new(OutboxError::from(e), "", None));
                return 0;
            }
        };

        let count = entries.len();
        for entry in entries {
            debug!(entry_id = %entry.id, attempts = entry.attempts, "Retrying outbox entry");
            self.deliver(entry, false).await;
        }

        if count > 0 {
            info!(retried = count, "Swept stale outbox entries");
        }
        count
    }

    /// Deliver a claimed entry and release it.
    ///
    /// Ephemeral handlers are only invoked on the first attempt.
    async fn deliver(&self, mut entry: OutboxEntry, first_attempt: bool) {
        let ctx = Context::new().with_namespace(entry.namespace.clone());
        let event = Arc::new(entry.event.clone());
        let mut complete = true;

        for registration in self.handlers.matching(&event).await {
            let handler = registration.handler;
            let handler_type = handler.handler_type();

            if middleware::is_ephemeral(handler.as_ref()) {
                if first_attempt {
                    if let Err(e) = handler.handle(ctx.clone(), Arc::clone(&event)).await {
                        self.report(e, &entry, &event);
                    }
                }
                continue;
            }

            if entry.is_delivered_to(&handler_type) {
                continue;
            }

            match handler.handle(ctx.clone(), Arc::clone(&event)).await {
                Ok(()) => entry.delivered_to.push(handler_type),
                Err(e) => {
                    complete = false;
                    self.report(e, &entry, &event);
                }
            }
        }

        let now = Utc::now();
        let claimed_at = entry.taken_at;
        entry.attempts += 1;
        entry.last_attempt = Some(now);
        entry.taken_at = now;
        entry.state = if complete {
            EntryState::Delivered
        } else if self
            .config
            .max_attempts
            .is_some_and(|max| entry.attempts >= max)
        {
            self.report(
                OutboxError::DeadLettered {
                    id: entry.id,
                    attempts: entry.attempts,
                },
                &entry,
                &event,
            );
            EntryState::Failed
        } else {
            EntryState::Pending
        };

        debug!(
            entry_id = %entry.id,
            state = %entry.state,
            attempts = entry.attempts,
            "Outbox delivery attempt finished"
        );

        if let Err(e) = self.store.release(&entry, claimed_at).await {
            self.report(OutboxError::from(e), &entry, &event);
        }
    }

    /// Hand back the claim of an entry whose delivery never started, in
    /// case the insert landed before the caller gave up.
    async fn release_unattempted(&self, entry: &OutboxEntry) {
        let mut pending = entry.clone();
        pending.state = EntryState::Pending;
        match self.store.release(&pending, entry.taken_at).await {
            Ok(()) => debug!(entry_id = %entry.id, "Released claim of cancelled enqueue"),
            Err(StoreError::ClaimLost(_)) => {
                debug!(entry_id = %entry.id, "Cancelled enqueue left nothing to release")
            }
            Err(e) => warn!(entry_id = %entry.id, error = %e, "Failed to release cancelled enqueue"),
        }
    }

    fn report(
        &self,
        err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
        entry: &OutboxEntry,
        event: &Arc<Event>,
    ) {
        self.errors.report(DeliveryError::new(
            err,
            entry.namespace.clone(),
            Some(Arc::clone(event)),
        ));
    }
}

/// `now - age`, clamped to the earliest representable instant.
fn cutoff(now: DateTime<Utc>, age: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S: OutboxStore> Drop for EventOutbox<S> {
    fn drop(&mut self) {
        if let Some(task) = self.lock_sweeper().take() {
            let _ = task.cancel.send(true);
        }
    }
}
