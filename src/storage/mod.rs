//! Event store interface.
//!
//! The event store persists versioned aggregate histories. It is the
//! component that feeds the outbox: a successful [`EventStore::save`]
//! hands the committed events to the configured outbox.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::{Cancelled, Context};
use crate::event::{AggregateType, Event, EventType};
use crate::outbox::OutboxError;

pub mod memory;

pub use memory::MemoryEventStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no events to save")]
    MissingEvents,

    #[error("events belong to more than one aggregate")]
    MismatchedAggregate,

    #[error("invalid event version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u64, actual: u64 },

    #[error("version conflict on aggregate {aggregate_id}: expected {expected}, stored {actual}")]
    VersionConflict {
        aggregate_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("aggregate {0} not found")]
    AggregateNotFound(Uuid),

    #[error("event version {version} of aggregate {aggregate_id} not found")]
    EventNotFound { aggregate_id: Uuid, version: u64 },

    #[error("events committed but {failed} of {total} not handed to the outbox: {source}")]
    Outbox {
        failed: usize,
        total: usize,
        #[source]
        source: OutboxError,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Interface for event persistence.
///
/// Histories are scoped by the namespace of the calling [`Context`].
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to one aggregate's history.
    ///
    /// `original_version` is the version the caller loaded; the first event
    /// must carry `original_version + 1` and the rest follow consecutively.
    /// Fails with [`StorageError::VersionConflict`] when another writer got
    /// there first. After the commit the events are enqueued to the outbox,
    /// if one is configured.
    async fn save(&self, ctx: &Context, events: Vec<Event>, original_version: u64) -> Result<()>;

    /// Full history of an aggregate, in version order. Empty if unknown.
    async fn load(&self, ctx: &Context, id: Uuid) -> Result<Vec<Arc<Event>>>;

    /// History from `version` onwards.
    async fn load_from(&self, ctx: &Context, id: Uuid, version: u64) -> Result<Vec<Arc<Event>>>;
}

/// Administrative rewrites of stored history.
#[async_trait]
pub trait EventStoreMaintenance: Send + Sync {
    /// Overwrite the stored event with the same aggregate and version.
    async fn replace(&self, ctx: &Context, event: Event) -> Result<()>;

    /// Rename every event of type `from` in the namespace to `to`.
    async fn rename_event(&self, ctx: &Context, from: &EventType, to: &EventType) -> Result<()>;
}

/// Check that `events` form a valid append after `original_version`.
pub fn validate_batch(events: &[Event], original_version: u64) -> Result<(AggregateType, Uuid)> {
    let first = events.first().ok_or(StorageError::MissingEvents)?;
    let aggregate_type = first.aggregate_type().clone();
    let id = first.aggregate_id();

    let mut expected = original_version + 1;
    for event in events {
        if event.aggregate_id() != id || event.aggregate_type() != &aggregate_type {
            return Err(StorageError::MismatchedAggregate);
        }
        if event.version() != expected {
            return Err(StorageError::InvalidVersion {
                expected,
                actual: event.version(),
            });
        }
        expected += 1;
    }

    Ok((aggregate_type, id))
}
