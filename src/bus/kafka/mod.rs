//! Kafka event bus implementation.
//!
//! One topic per bus, `BusConfig::topic()`.
//! Message key: aggregate id (ensures ordering per aggregate)
//! Consumer group per handler: `{app_id}_{handler_type}`
//!
//! Offsets are committed manually after the handler ran. Handler failures
//! are reported on the error channel and the offset is still committed;
//! use an outbox in front of the handler when it needs durable retry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{self, Subscription};
use super::{bus_handler_type, codec, BusConfig, BusError, EventBus, Result, StartOffset};
use crate::context::Context;
use crate::errors::{ErrorChannel, ErrorReceiver};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerRegistry, HandlerType};
use crate::matcher::Matcher;
use crate::utils::retry::reconnect_backoff;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a ClientConfig for producers.
fn producer_config(config: &BusConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.address);
    client.set("message.timeout.ms", "5000");
    client.set("acks", "all");
    client.set("enable.idempotence", "true");
    client
}

/// Build a ClientConfig for the admin client used for topic checks.
fn admin_config(config: &BusConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.address);
    client.set("allow.auto.create.topics", "false");
    client
}

/// Build a ClientConfig for a group member.
fn consumer_config(config: &BusConfig, group_id: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.address);
    client.set("group.id", group_id);
    client.set("enable.auto.commit", "false");
    client.set("auto.offset.reset", offset_reset(config.start_offset));
    client.set("allow.auto.create.topics", "false");
    client
}

fn offset_reset(start: StartOffset) -> &'static str {
    match start {
        StartOffset::Latest => "latest",
        StartOffset::Earliest | StartOffset::Offset(_) => "earliest",
    }
}

/// Messages below an explicit start offset are skipped (and committed).
fn skip_offset(start: StartOffset, offset: i64) -> bool {
    matches!(start, StartOffset::Offset(n) if offset < n)
}

fn message_key(event: &Event) -> String {
    event.aggregate_id().as_hyphenated().to_string()
}

/// Kafka event bus implementation.
///
/// Events of one aggregate share a key and therefore a partition.
/// Subscribers use consumer groups for load balancing across instances.
pub struct KafkaEventBus {
    config: BusConfig,
    topic: String,
    producer: FutureProducer,
    handlers: HandlerRegistry,
    errors: ErrorChannel,
    cancel: watch::Sender<bool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl KafkaEventBus {
    /// Create a new Kafka event bus.
    ///
    /// Validates the configuration, then makes sure the topic exists,
    /// creating it with the configured partition count when allowed.
    pub async fn new(config: BusConfig) -> Result<Self> {
        config.validate_remote()?;
        let topic = config.topic();

        let producer: FutureProducer = producer_config(&config)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        ensure_topic(&config, &topic).await?;

        info!(
            bootstrap_servers = %config.address,
            app_id = %config.app_id,
            topic = %topic,
            "Connected to Kafka"
        );

        let (cancel, _) = watch::channel(false);
        Ok(Self {
            config,
            topic,
            producer,
            handlers: HandlerRegistry::new(),
            errors: ErrorChannel::default(),
            cancel,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

async fn ensure_topic(config: &BusConfig, topic: &str) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = admin_config(config)
        .create()
        .map_err(|e| BusError::Connection(format!("Failed to create Kafka admin client: {}", e)))?;
    let admin = Arc::new(admin);

    let exists = {
        let admin = Arc::clone(&admin);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            admin
                .inner()
                .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty())
                })
        })
        .await
        .map_err(|e| BusError::Connection(format!("Metadata task failed: {}", e)))?
        .map_err(|e| BusError::Connection(format!("Failed to fetch Kafka metadata: {}", e)))?
    };

    if exists {
        return Ok(());
    }
    if !config.auto_create_topic {
        return Err(BusError::TopicNotFound(topic.to_string()));
    }

    let new_topic = NewTopic::new(topic, config.partitions, TopicReplication::Fixed(1));
    let options = AdminOptions::new().operation_timeout(Some(METADATA_TIMEOUT));
    let results = admin
        .create_topics(&[new_topic], &options)
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create topic: {}", e)))?;

    for result in results {
        match result {
            Ok(name) => info!(topic = %name, partitions = config.partitions, "Created Kafka topic"),
            Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
            Err((name, code)) => {
                return Err(BusError::Connection(format!(
                    "Failed to create topic {}: {}",
                    name, code
                )))
            }
        }
    }
    Ok(())
}

#[async_trait]
impl EventBus for KafkaEventBus {
    fn handler_type(&self) -> HandlerType {
        bus_handler_type(&self.config.app_id)
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %self.topic, event = %event))]
    async fn publish(&self, ctx: &Context, event: Arc<Event>) -> Result<()> {
        self.ensure_open()?;

        let key = message_key(&event);
        let payload = codec::encode(ctx.namespace(), &event)?;
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        let (partition, offset) = ctx
            .guard(self.producer.send(record, SEND_TIMEOUT))
            .await?
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(key = %key, partition, offset, "Published event to Kafka");
        Ok(())
    }

    async fn add_handler(
        &self,
        _ctx: &Context,
        matcher: Matcher,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.ensure_open()?;

        let handler_type = handler.handler_type();
        if !self.handlers.add(matcher.clone(), Arc::clone(&handler)).await {
            return Err(BusError::HandlerAlreadyAdded(handler_type));
        }

        let group_id = self.config.group_id(handler_type.as_str());
        let consumer = match subscribe(&self.config, &group_id, &self.topic) {
            Ok(consumer) => consumer,
            Err(e) => {
                self.handlers.remove(&handler_type).await;
                return Err(e);
            }
        };

        let handle = tokio::spawn(consume(
            consumer,
            Subscription { matcher, handler },
            self.errors.clone(),
            self.config.start_offset,
            self.cancel.subscribe(),
        ));
        lock(&self.consumers).push(handle);

        info!(topic = %self.topic, group = %group_id, "Subscribed to Kafka topic");
        Ok(())
    }

    fn errors(&self) -> ErrorReceiver {
        self.errors.receiver()
    }

    async fn close(&self) -> Result<()> {
        if self.cancel.send_replace(true) {
            return Ok(());
        }

        let consumers: Vec<JoinHandle<()>> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Kafka consumer ended abnormally");
            }
        }

        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(SEND_TIMEOUT)).await;
        if let Ok(Err(e)) = flushed {
            warn!(error = %e, "Failed to flush Kafka producer");
        }

        info!(topic = %self.topic, "Kafka event bus closed");
        Ok(())
    }
}

impl Drop for KafkaEventBus {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn subscribe(config: &BusConfig, group_id: &str, topic: &str) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = consumer_config(config, group_id)
        .create()
        .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;
    consumer
        .subscribe(&[topic])
        .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to topic: {}", e)))?;
    Ok(consumer)
}

/// Receive loop with exponential backoff on consumer errors.
async fn consume(
    consumer: StreamConsumer,
    subscription: Subscription,
    errors: ErrorChannel,
    start_offset: StartOffset,
    mut cancel: watch::Receiver<bool>,
) {
    let backoff_builder = reconnect_backoff();
    let mut backoff_iter = backoff_builder.build();
    let mut stream = consumer.stream();

    loop {
        let next = tokio::select! {
            res = cancel.changed() => {
                if res.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                error!(
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    "Kafka consumer error, retrying after backoff"
                );
                dispatch::report_transport(&errors, BusError::Subscribe(e.to_string()));
                tokio::time::sleep(delay).await;
                continue;
            }
            None => break,
        };

        // Reset backoff once messages flow again
        backoff_iter = backoff_builder.build();

        if skip_offset(start_offset, message.offset()) {
            debug!(offset = message.offset(), "Skipping message below start offset");
        } else if let Some(payload) = message.payload() {
            let result = dispatch::process_message(payload, &subscription, &errors).await;
            debug!(
                topic = %message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                result = ?result,
                "Processed Kafka message"
            );
        } else {
            warn!(offset = message.offset(), "Received message with no payload");
        }

        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
            error!(error = %e, "Failed to commit offset");
            dispatch::report_transport(&errors, BusError::Subscribe(e.to_string()));
        }
    }

    debug!("Kafka consumer stopped");
}

#[cfg(test)]
mod tests;
