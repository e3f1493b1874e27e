//! Outbox pattern for guaranteed event delivery.
//!
//! An outbox durably records every enqueued event before delivering it to
//! the registered handlers. The flow:
//!
//! 1. Write the entry to the [`OutboxStore`] (claimed by the enqueuing call)
//! 2. Deliver to matching handlers immediately
//! 3. Remove the entry once every matching handler succeeded
//!
//! If step 2 fails for any handler the entry stays pending. A background
//! sweep re-delivers pending entries older than the sweep age to the
//! handlers that have not yet succeeded, including handlers registered after
//! the event was enqueued. Delivery is at-least-once; handlers must be
//! idempotent.
//!
//! Handlers wrapped with [`crate::middleware::ephemeral`] are invoked during
//! step 2 only and never retried.
//!
//! # Configuration
//!
//! ```yaml
//! outbox:
//!   sweep_interval_ms: 1000
//!   sweep_age_ms: 10000
//!   claim_lease_ms: 60000
//!   sweep_batch_size: 100
//!   max_attempts: 10        # omit to retry forever
//! ```

mod entry;
mod event_outbox;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::context::{Cancelled, Context};
use crate::errors::{ErrorReceiver, DEFAULT_ERROR_CAPACITY};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerType};
use crate::matcher::Matcher;

pub use entry::{EntryState, OutboxEntry};
pub use event_outbox::EventOutbox;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;
pub use store::{ClaimQuery, MemoryOutboxStore, OutboxStore, StoreError};

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox is closed")]
    Closed,

    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),

    #[error("handler '{0}' already added")]
    HandlerAlreadyAdded(HandlerType),

    #[error("could not create outbox for namespace '{namespace}': {source}")]
    Namespace {
        namespace: String,
        #[source]
        source: Box<OutboxError>,
    },

    #[error("outbox entry {id} failed permanently after {attempts} attempts")]
    DeadLettered { id: Uuid, attempts: u32 },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("{0}")]
    Other(String),
}

/// Durable staging area for events pending delivery.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Register a handler for events accepted by `matcher`.
    async fn add_handler(
        &self,
        ctx: &Context,
        matcher: Matcher,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>;

    /// Unregister the handler of type `handler_type`. Returns whether it
    /// was registered.
    async fn remove_handler(&self, ctx: &Context, handler_type: &HandlerType) -> Result<bool>;

    /// Durably record `event`, then attempt immediate delivery.
    ///
    /// Returns once the entry is recorded; delivery failures are reported on
    /// [`Outbox::errors`] and retried by the sweep.
    async fn enqueue(&self, ctx: &Context, event: Event) -> Result<()>;

    /// Start the background sweep. Calling it again has no effect.
    ///
    /// Must be called from within a tokio runtime.
    fn start(&self);

    /// Stop the sweep and reject further operations.
    async fn close(&self) -> Result<()>;

    /// Asynchronous delivery errors.
    fn errors(&self) -> ErrorReceiver;
}

/// Outbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Interval between sweeps in milliseconds. Default: 1000.
    pub sweep_interval_ms: u64,
    /// Pending entries last attempted longer ago than this are retried.
    /// Default: 10000.
    pub sweep_age_ms: u64,
    /// In-flight claims older than this are considered abandoned (the
    /// claiming process died) and are reclaimed. Default: 60000.
    pub claim_lease_ms: u64,
    /// Maximum entries claimed per sweep. Default: 100.
    pub sweep_batch_size: usize,
    /// Attempts after which an entry is dead-lettered. Default: unbounded.
    pub max_attempts: Option<u32>,
    /// Capacity of the error channel. Default: 100.
    pub error_channel_capacity: usize,
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            sweep_age_ms: 10_000,
            claim_lease_ms: 60_000,
            sweep_batch_size: 100,
            max_attempts: None,
            error_channel_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

impl OutboxConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn sweep_age(&self) -> Duration {
        Duration::from_millis(self.sweep_age_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    /// Shorten sweep interval and age, keeping the rest.
    pub fn with_sweep(mut self, interval: Duration, age: Duration) -> Self {
        self.sweep_interval_ms = saturating_millis(interval);
        self.sweep_age_ms = saturating_millis(age);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[cfg(test)]
mod tests;
