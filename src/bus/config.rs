//! Bus identity and construction-time options.

use serde::Deserialize;

use super::{BusError, Result};

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// From the oldest retained event.
    #[default]
    Earliest,
    /// Only events published after the group was created.
    Latest,
    /// From an explicit offset (per partition).
    Offset(i64),
}

/// Bus identity.
///
/// | field | default |
/// |-------|---------|
/// | `app_id` | random `app-<16 hex>` |
/// | `topic` | `<app_id>_events` |
/// | `partitions` | 1 |
/// | `start_offset` | earliest |
/// | `auto_create_topic` | true |
///
/// Every bus constructor calls [`BusConfig::validate`] before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Broker address. Unused by the channel bus.
    pub address: String,
    /// Consumer group identity shared by cooperating instances.
    pub app_id: String,
    topic: Option<String>,
    pub partitions: i32,
    pub start_offset: StartOffset,
    /// Create the topic when missing; otherwise construction fails.
    pub auto_create_topic: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl BusConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            app_id: random_app_id(),
            topic: None,
            partitions: 1,
            start_offset: StartOffset::Earliest,
            auto_create_topic: true,
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_start_offset(mut self, start_offset: StartOffset) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn with_auto_create_topic(mut self, auto_create: bool) -> Self {
        self.auto_create_topic = auto_create;
        self
    }

    /// Topic name, `<app_id>_events` unless set explicitly.
    pub fn topic(&self) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| format!("{}_events", self.app_id))
    }

    /// Consumer group of `handler_type` within this application.
    pub fn group_id(&self, handler_type: &str) -> String {
        format!("{}_{}", self.app_id, handler_type)
    }

    /// Validate the options. Never coerces invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.partitions <= 0 {
            return Err(BusError::InvalidPartitions(self.partitions));
        }
        if self.app_id.trim().is_empty() {
            return Err(BusError::Config("app id must not be empty".to_string()));
        }
        if self.topic().trim().is_empty() {
            return Err(BusError::Config("topic must not be empty".to_string()));
        }
        if let StartOffset::Offset(offset) = self.start_offset {
            if offset < 0 {
                return Err(BusError::Config(format!(
                    "start offset must not be negative, got {offset}"
                )));
            }
        }
        Ok(())
    }

    /// [`BusConfig::validate`] plus a non-empty address, for network buses.
    pub fn validate_remote(&self) -> Result<()> {
        self.validate()?;
        if self.address.trim().is_empty() {
            return Err(BusError::Config("broker address must not be empty".to_string()));
        }
        Ok(())
    }
}

fn random_app_id() -> String {
    let id = uuid::Uuid::new_v4();
    format!("app-{}", hex::encode(&id.as_bytes()[..8]))
}
