//! Event bus for cross-process delivery.
//!
//! This module contains:
//! - `EventBus` trait: publish/subscribe with consumer-group semantics
//! - `BusConfig`: bus identity, validated before any I/O
//! - Wire codec shared by the broker adapters
//! - Implementations: in-process channel, Kafka, NATS JetStream
//!
//! Buses sharing an application id form one consumer group per handler
//! type: each event reaches exactly one member. Buses with different
//! application ids each receive the full stream.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

use crate::context::{Cancelled, Context};
use crate::errors::ErrorReceiver;
use crate::event::Event;
use crate::handler::{EventHandler, HandlerError, HandlerType};
use crate::matcher::Matcher;

#[cfg(feature = "channel")]
pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatch;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "nats")]
pub mod nats;

#[cfg(feature = "channel")]
pub use channel::{ChannelBroker, ChannelEventBus};
pub use self::config::{BusConfig, StartOffset};
#[cfg(feature = "kafka")]
pub use kafka::KafkaEventBus;
#[cfg(feature = "nats")]
pub use nats::NatsEventBus;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid bus configuration: {0}")]
    Config(String),

    #[error("number of partitions must be greater than 0, got {0}")]
    InvalidPartitions(i32),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("topic '{0}' does not exist and auto-creation is disabled")]
    TopicNotFound(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("handler '{0}' already added")]
    HandlerAlreadyAdded(HandlerType),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("event bus is closed")]
    Closed,
}

/// Publish/subscribe transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Stable identity of this bus when it is used as a handler.
    fn handler_type(&self) -> HandlerType;

    /// Publish an event to every consumer group on the topic.
    async fn publish(&self, ctx: &Context, event: Arc<Event>) -> Result<()>;

    /// Subscribe `handler` as a member of the group
    /// `"{app_id}_{handler_type}"`.
    ///
    /// Fails when the subscription cannot be established.
    async fn add_handler(
        &self,
        ctx: &Context,
        matcher: Matcher,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>;

    /// Asynchronous delivery and transport errors.
    fn errors(&self) -> ErrorReceiver;

    /// Stop consuming and release transport resources.
    async fn close(&self) -> Result<()>;
}

/// Adapt a bus into a handler that publishes what it receives, so an
/// outbox can forward events to it.
pub fn as_handler(bus: Arc<dyn EventBus>) -> Arc<dyn EventHandler> {
    Arc::new(BusHandler { bus })
}

struct BusHandler {
    bus: Arc<dyn EventBus>,
}

impl EventHandler for BusHandler {
    fn handler_type(&self) -> HandlerType {
        self.bus.handler_type()
    }

    fn handle(
        &self,
        ctx: Context,
        event: Arc<Event>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let bus = Arc::clone(&self.bus);
        Box::pin(async move {
            bus.publish(&ctx, event)
                .await
                .map_err(|e| HandlerError::failed(bus.handler_type(), e.to_string()))
        })
    }
}

/// Handler type a bus reports for an application id.
pub(crate) fn bus_handler_type(app_id: &str) -> HandlerType {
    HandlerType::new(format!("eventbus_{app_id}"))
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process channel bus.
    #[default]
    Channel,
    /// Kafka (partitioned log).
    Kafka,
    /// NATS JetStream (subject pub/sub).
    Nats,
}

/// Messaging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Broker address. Kafka: bootstrap servers; NATS: server URL.
    pub address: String,
    /// Application id. Random when unset.
    pub app_id: Option<String>,
    /// Topic name. `<app_id>_events` when unset.
    pub topic: Option<String>,
    pub partitions: i32,
    pub start_offset: StartOffset,
    pub auto_create_topic: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            address: String::new(),
            app_id: None,
            topic: None,
            partitions: 1,
            start_offset: StartOffset::Earliest,
            auto_create_topic: true,
        }
    }
}

impl MessagingConfig {
    /// Bus identity described by this configuration.
    pub fn bus_config(&self) -> BusConfig {
        let mut config = BusConfig::new(self.address.clone())
            .with_partitions(self.partitions)
            .with_start_offset(self.start_offset)
            .with_auto_create_topic(self.auto_create_topic);
        if let Some(app_id) = &self.app_id {
            config = config.with_app_id(app_id.clone());
        }
        if let Some(topic) = &self.topic {
            config = config.with_topic(topic.clone());
        }
        config
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize event bus based on configuration.
///
/// Returns the appropriate EventBus implementation based on messaging_type.
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (default), on the process-wide broker
/// - Kafka: `--features kafka`
/// - NATS: `--features nats`
pub async fn init_event_bus(config: &MessagingConfig) -> Result<Arc<dyn EventBus>> {
    let bus_config = config.bus_config();
    bus_config.validate()?;

    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                let bus = ChannelEventBus::new(ChannelBroker::global(), bus_config)?;
                info!(messaging_type = "channel", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err(BusError::Config(
                    "Channel bus requires the 'channel' feature. Rebuild with --features channel"
                        .to_string(),
                ))
            }
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let bus = KafkaEventBus::new(bus_config).await?;
                info!(messaging_type = "kafka", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(BusError::Config(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
        MessagingType::Nats => {
            #[cfg(feature = "nats")]
            {
                let bus = NatsEventBus::new(bus_config).await?;
                info!(messaging_type = "nats", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err(BusError::Config(
                    "NATS support requires the 'nats' feature. Rebuild with --features nats"
                        .to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_event, RecordingHandler};

    #[test]
    fn test_messaging_config_default() {
        let config = MessagingConfig::default();
        assert_eq!(config.messaging_type, MessagingType::Channel);
        assert_eq!(config.partitions, 1);
        assert!(config.auto_create_topic);
    }

    #[test]
    fn test_messaging_config_to_bus_config() {
        let config = MessagingConfig {
            app_id: Some("orders".to_string()),
            partitions: 4,
            ..Default::default()
        };
        let bus = config.bus_config();
        assert_eq!(bus.app_id, "orders");
        assert_eq!(bus.topic(), "orders_events");
        assert_eq!(bus.partitions, 4);
    }

    #[tokio::test]
    async fn test_init_event_bus_rejects_invalid_partitions() {
        let config = MessagingConfig {
            partitions: 0,
            ..Default::default()
        };
        let result = init_event_bus(&config).await;
        assert!(matches!(result, Err(BusError::InvalidPartitions(0))));
    }

    #[cfg(feature = "channel")]
    #[tokio::test]
    async fn test_bus_as_outbox_handler() {
        let broker = Arc::new(ChannelBroker::new());
        let bus: Arc<dyn EventBus> = Arc::new(
            ChannelEventBus::new(Arc::clone(&broker), BusConfig::default().with_app_id("relay")).unwrap(),
        );
        let received = RecordingHandler::new("downstream");
        bus.add_handler(&Context::new(), Matcher::All, received.clone().into_arc())
            .await
            .unwrap();

        let handler = as_handler(Arc::clone(&bus));
        assert_eq!(handler.handler_type(), HandlerType::new("eventbus_relay"));

        let ctx = Context::new().with_namespace("tenant");
        handler
            .handle(ctx, Arc::new(make_event("Forwarded", 1)))
            .await
            .unwrap();

        assert!(received.wait_for(1, std::time::Duration::from_secs(1)).await);
        assert_eq!(received.namespaces(), vec!["tenant".to_string()]);
        bus.close().await.unwrap();
    }
}
