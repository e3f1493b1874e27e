//! NATS JetStream event bus implementation.
//!
//! - Stream: the bus topic, sanitised into a valid stream name
//! - Subjects: `{stream}.{aggregate_type}.{aggregate_id}`
//! - Deduplication: `Nats-Msg-Id` = `{namespace}.{aggregate_id}.{version}`
//! - Durable pull consumer per handler: `{app_id}_{handler_type}`. All
//!   members of one application pull from the same consumer and compete
//!   for messages.
//!
//! Messages are acknowledged explicitly. A handler failure NAKs the message
//! so JetStream redelivers it; undecodable messages are acked and reported.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream::{RetentionPolicy, StorageType},
    AckKind,
};
use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::StreamExt;
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
use crate::utils::bootstrap::connect_with_retry;
use crate::utils::retry::reconnect_backoff;

const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Replace characters JetStream forbids in stream names and subject tokens.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '*' | '>' | '/' | '\\' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn subject(stream: &str, event: &Event) -> String {
    format!(
        "{}.{}.{}",
        stream,
        sanitize(event.aggregate_type().as_str()),
        event.aggregate_id().as_hyphenated()
    )
}

/// Aggregate ids are only unique within a namespace.
fn msg_id(namespace: &str, event: &Event) -> String {
    format!(
        "{}.{}.{}",
        namespace,
        event.aggregate_id().as_hyphenated(),
        event.version()
    )
}

/// JetStream sequences start at 1; `Offset(n)` counts from 0.
fn deliver_policy(start: StartOffset) -> DeliverPolicy {
    match start {
        StartOffset::Earliest => DeliverPolicy::All,
        StartOffset::Latest => DeliverPolicy::New,
        StartOffset::Offset(n) => DeliverPolicy::ByStartSequence {
            start_sequence: n.max(0) as u64 + 1,
        },
    }
}

fn consumer_config(durable: &str, start: StartOffset) -> pull::Config {
    pull::Config {
        durable_name: Some(durable.to_string()),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: deliver_policy(start),
        ..Default::default()
    }
}

/// NATS JetStream event bus.
pub struct NatsEventBus {
    config: BusConfig,
    stream_name: String,
    client: async_nats::Client,
    jetstream: jetstream::Context,
    handlers: HandlerRegistry,
    errors: ErrorChannel,
    cancel: watch::Sender<bool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsEventBus {
    /// Connect to the server at `config.address` and make sure the stream
    /// exists.
    pub async fn new(config: BusConfig) -> Result<Self> {
        config.validate_remote()?;

        let address = config.address.clone();
        let client = connect_with_retry("nats", &address, || async_nats::connect(address.as_str()))
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        Self::from_client(client, config).await
    }

    /// Build a bus on an existing client.
    pub async fn from_client(client: async_nats::Client, config: BusConfig) -> Result<Self> {
        config.validate()?;
        let stream_name = sanitize(&config.topic());
        let jetstream = jetstream::new(client.clone());

        ensure_stream(&jetstream, &stream_name, config.auto_create_topic).await?;

        info!(
            app_id = %config.app_id,
            stream = %stream_name,
            "Connected to NATS JetStream"
        );

        let (cancel, _) = watch::channel(false);
        Ok(Self {
            config,
            stream_name,
            client,
            jetstream,
            handlers: HandlerRegistry::new(),
            errors: ErrorChannel::default(),
            cancel,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    async fn consumer(&self, durable: &str) -> Result<PullConsumer> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to get stream: {}", e)))?;
        stream
            .get_or_create_consumer(durable, consumer_config(durable, self.config.start_offset))
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to create consumer: {}", e)))
    }
}

async fn ensure_stream(jetstream: &jetstream::Context, name: &str, auto_create: bool) -> Result<()> {
    if !auto_create {
        return match jetstream.get_stream(name).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(stream = %name, error = %e, "Stream lookup failed");
                Err(BusError::TopicNotFound(name.to_string()))
            }
        };
    }

    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: name.to_string(),
            subjects: vec![format!("{}.>", name)],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create stream: {}", e)))?;
    Ok(())
}

#[async_trait]
impl EventBus for NatsEventBus {
    fn handler_type(&self) -> HandlerType {
        bus_handler_type(&self.config.app_id)
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(stream = %self.stream_name, event = %event))]
    async fn publish(&self, ctx: &Context, event: Arc<Event>) -> Result<()> {
        self.ensure_open()?;

        let subject = subject(&self.stream_name, &event);
        let msg_id = msg_id(ctx.namespace(), &event);
        let payload = codec::encode(ctx.namespace(), &event)?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, msg_id.as_str());

        let ack = ctx
            .guard(async {
                self.jetstream
                    .publish_with_headers(subject.clone(), headers, payload.into())
                    .await
                    .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
                    .await
                    .map_err(|e| BusError::Publish(format!("Publish ack failed: {}", e)))
            })
            .await??;

        debug!(
            subject = %subject,
            msg_id = %msg_id,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Published event to NATS"
        );
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

        let durable = sanitize(&self.config.group_id(handler_type.as_str()));
        let consumer = match self.consumer(&durable).await {
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
            self.cancel.subscribe(),
        ));
        lock(&self.consumers).push(handle);

        info!(stream = %self.stream_name, consumer = %durable, "Subscribed to NATS stream");
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
                warn!(error = %e, "NATS consumer ended abnormally");
            }
        }

        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS client");
        }

        info!(stream = %self.stream_name, "NATS event bus closed");
        Ok(())
    }
}

impl Drop for NatsEventBus {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pull loop. Re-opens the message stream with exponential backoff when it
/// fails or ends.
async fn consume(
    consumer: PullConsumer,
    subscription: Subscription,
    errors: ErrorChannel,
    mut cancel: watch::Receiver<bool>,
) {
    let backoff_builder = reconnect_backoff();
    let mut backoff_iter = backoff_builder.build();

    'reconnect: loop {
        if *cancel.borrow() {
            break;
        }

        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(e) => {
                let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                error!(
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    "Failed to open NATS message stream, retrying after backoff"
                );
                dispatch::report_transport(&errors, BusError::Subscribe(e.to_string()));
                if sleep_or_cancel(delay, &mut cancel).await {
                    break;
                }
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        break 'reconnect;
                    }
                    continue;
                }
                next = messages.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "NATS consumer error, reconnecting after backoff"
                    );
                    dispatch::report_transport(&errors, BusError::Subscribe(e.to_string()));
                    if sleep_or_cancel(delay, &mut cancel).await {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                }
                None => {
                    warn!("NATS message stream ended, reconnecting");
                    continue 'reconnect;
                }
            };

            // Reset backoff once messages flow again
            backoff_iter = backoff_builder.build();

            let result = dispatch::process_message(&message.payload, &subscription, &errors).await;
            debug!(subject = %message.subject, result = ?result, "Processed NATS message");

            let acked = if result.should_ack() {
                message.ack().await
            } else {
                message.ack_with(AckKind::Nak(None)).await
            };
            if let Err(e) = acked {
                error!(error = %e, "Failed to acknowledge NATS message");
                dispatch::report_transport(&errors, BusError::Subscribe(e.to_string()));
            }
        }
    }

    debug!("NATS consumer stopped");
}

/// Returns true when cancelled during the sleep.
async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        res = cancel.changed() => res.is_err() || *cancel.borrow(),
    }
}
