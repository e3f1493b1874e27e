//! Domain event value types.
//!
//! Events are produced by aggregates and persisted by the event store; this
//! crate only carries them. Once handed to delivery they travel as
//! `Arc<Event>` so every handler observes the same immutable value.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an event type, e.g. `"OrderPlaced"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifier of an aggregate type, e.g. `"Order"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

impl AggregateType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Reference to the aggregate an event belongs to.
///
/// Events sharing `(aggregate_type, id)` form a strictly increasing
/// `version` sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub aggregate_type: AggregateType,
    pub id: Uuid,
    pub version: u64,
}

impl AggregateRef {
    pub fn new(aggregate_type: impl Into<AggregateType>, id: Uuid, version: u64) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            id,
            version,
        }
    }
}

/// An immutable domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: EventType,
    #[serde(default)]
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
    aggregate: AggregateRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// Create an event with the given payload, timestamped now.
    pub fn new(
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        aggregate: AggregateRef,
    ) -> Self {
        Self::at(event_type, data, Utc::now(), aggregate)
    }

    /// Create an event with an explicit timestamp.
    pub fn at(
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
        aggregate: AggregateRef,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp,
            aggregate,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata value, replacing any previous value under `key`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn aggregate(&self) -> &AggregateRef {
        &self.aggregate
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate.aggregate_type
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate.id
    }

    pub fn version(&self) -> u64 {
        self.aggregate.version
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Copy of this event under a different type name.
    ///
    /// Used by event store maintenance when renaming event types.
    pub fn renamed(&self, event_type: EventType) -> Self {
        Self {
            event_type,
            ..self.clone()
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}({}, v{})",
            self.event_type, self.aggregate.aggregate_type, self.aggregate.id, self.aggregate.version
        )
    }
}
