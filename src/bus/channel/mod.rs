//! In-memory channel-based event bus.
//!
//! A [`ChannelBroker`] stands in for a partitioned log within one process:
//! each topic holds `partitions` retained logs of encoded messages, and
//! consumer groups track one committed offset per partition. Ideal for
//! local development and testing without external dependencies.
//!
//! - Events land on partition `aggregate_id % partitions`
//! - Group `"{app_id}_{handler_type}"`: partition `p` is owned by member
//!   `p % members`, so a group divides the stream. A partition changes
//!   hands only once its previous owner has committed the message it was
//!   handling.
//! - Distinct groups each read every partition

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{self, Subscription};
use super::{bus_handler_type, codec, BusConfig, BusError, EventBus, Result, StartOffset};
use crate::context::Context;
use crate::errors::{ErrorChannel, ErrorReceiver};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerRegistry, HandlerType};
use crate::matcher::Matcher;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process stand-in for a partitioned log broker.
#[derive(Default)]
pub struct ChannelBroker {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide broker used by [`super::init_event_bus`].
    pub fn global() -> Arc<ChannelBroker> {
        static GLOBAL: OnceLock<Arc<ChannelBroker>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ChannelBroker::new())))
    }

    /// Create a topic ahead of time. Existing topics keep their partition
    /// count.
    pub fn create_topic(&self, name: &str, partitions: i32) -> Result<()> {
        if partitions <= 0 {
            return Err(BusError::InvalidPartitions(partitions));
        }
        self.topic(name, partitions, true).map(|_| ())
    }

    /// Partition count of `name`, if it exists.
    pub fn partitions(&self, name: &str) -> Option<usize> {
        lock(&self.topics).get(name).map(|t| t.partitions.len())
    }

    fn topic(&self, name: &str, partitions: i32, auto_create: bool) -> Result<Arc<Topic>> {
        let mut topics = lock(&self.topics);
        if let Some(topic) = topics.get(name) {
            if topic.partitions.len() != partitions as usize {
                warn!(
                    topic = %name,
                    existing = topic.partitions.len(),
                    requested = partitions,
                    "Channel topic exists with a different partition count, keeping existing"
                );
            }
            return Ok(Arc::clone(topic));
        }
        if !auto_create {
            return Err(BusError::TopicNotFound(name.to_string()));
        }

        let topic = Arc::new(Topic::new(name, partitions as usize));
        topics.insert(name.to_string(), Arc::clone(&topic));
        info!(topic = %name, partitions, "Created channel topic");
        Ok(topic)
    }
}

struct Topic {
    name: String,
    partitions: Vec<Mutex<Vec<Arc<Vec<u8>>>>>,
    groups: Mutex<HashMap<String, Group>>,
    /// Bumped on every append and membership change.
    changed: watch::Sender<u64>,
    next_member: AtomicU64,
}

struct Group {
    /// Next offset to deliver, per partition.
    offsets: Vec<usize>,
    /// Member currently handling each partition's next offset.
    in_flight: Vec<Option<u64>>,
    members: Vec<u64>,
}

impl Group {
    fn owns(&self, member: u64, partition: usize) -> bool {
        self.members
            .iter()
            .position(|m| *m == member)
            .is_some_and(|index| partition % self.members.len() == index)
    }
}

impl Topic {
    fn new(name: &str, partitions: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
            groups: Mutex::new(HashMap::new()),
            changed,
            next_member: AtomicU64::new(0),
        }
    }

    fn partition_for(&self, key: Uuid) -> usize {
        (key.as_u128() % self.partitions.len() as u128) as usize
    }

    fn append(&self, key: Uuid, payload: Vec<u8>) -> (usize, usize) {
        let partition = self.partition_for(key);
        let offset = {
            let mut log = lock(&self.partitions[partition]);
            log.push(Arc::new(payload));
            log.len() - 1
        };
        self.notify();
        (partition, offset)
    }

    fn join(&self, group_id: &str, start: StartOffset) -> u64 {
        let member = self.next_member.fetch_add(1, Ordering::SeqCst);
        {
            let mut groups = lock(&self.groups);
            let group = groups.entry(group_id.to_string()).or_insert_with(|| Group {
                offsets: self.start_offsets(start),
                in_flight: vec![None; self.partitions.len()],
                members: Vec::new(),
            });
            group.members.push(member);
        }
        self.notify();
        member
    }

    fn leave(&self, group_id: &str, member: u64) {
        if let Some(group) = lock(&self.groups).get_mut(group_id) {
            group.members.retain(|m| *m != member);
            for holder in group.in_flight.iter_mut() {
                if *holder == Some(member) {
                    *holder = None;
                }
            }
        }
        self.notify();
    }

    fn start_offsets(&self, start: StartOffset) -> Vec<usize> {
        self.partitions
            .iter()
            .map(|log| match start {
                StartOffset::Earliest => 0,
                StartOffset::Latest => lock(log).len(),
                StartOffset::Offset(n) => n.max(0) as usize,
            })
            .collect()
    }

    /// Take the next undelivered message in a partition owned by `member`.
    ///
    /// The partition stays marked in flight for `member` until
    /// [`Topic::commit`], so a newly assigned owner waits for the handover.
    fn next(&self, group_id: &str, member: u64) -> Option<(usize, usize, Arc<Vec<u8>>)> {
        let mut groups = lock(&self.groups);
        let group = groups.get_mut(group_id)?;

        let (partition, offset, payload) = (0..self.partitions.len())
            .filter(|p| group.owns(member, *p))
            .filter(|p| group.in_flight[*p].map_or(true, |holder| holder == member))
            .find_map(|p| {
                let offset = group.offsets[p];
                lock(&self.partitions[p])
                    .get(offset)
                    .map(|payload| (p, offset, Arc::clone(payload)))
            })?;

        group.in_flight[partition] = Some(member);
        Some((partition, offset, payload))
    }

    fn commit(&self, group_id: &str, member: u64, partition: usize, offset: usize) {
        let released = match lock(&self.groups).get_mut(group_id) {
            Some(group) if group.in_flight[partition] == Some(member) => {
                group.in_flight[partition] = None;
                if group.offsets[partition] == offset {
                    group.offsets[partition] = offset + 1;
                }
                true
            }
            _ => false,
        };
        if released {
            // Wake a member waiting to take the partition over.
            self.notify();
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// In-memory event bus on a [`ChannelBroker`].
pub struct ChannelEventBus {
    config: BusConfig,
    topic: Arc<Topic>,
    handlers: HandlerRegistry,
    errors: ErrorChannel,
    cancel: watch::Sender<bool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChannelEventBus {
    /// Create a bus on `broker`.
    ///
    /// Fails on invalid configuration, or when the topic is missing and
    /// auto-creation is disabled.
    pub fn new(broker: Arc<ChannelBroker>, config: BusConfig) -> Result<Self> {
        config.validate()?;
        let topic = broker.topic(&config.topic(), config.partitions, config.auto_create_topic)?;
        let (cancel, _) = watch::channel(false);

        info!(
            app_id = %config.app_id,
            topic = %topic.name,
            partitions = topic.partitions.len(),
            "Channel event bus initialized"
        );

        Ok(Self {
            config,
            topic,
            handlers: HandlerRegistry::new(),
            errors: ErrorChannel::default(),
            cancel,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    fn handler_type(&self) -> HandlerType {
        bus_handler_type(&self.config.app_id)
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %self.topic.name, event = %event))]
    async fn publish(&self, ctx: &Context, event: Arc<Event>) -> Result<()> {
        self.ensure_open()?;
        ctx.guard(std::future::ready(())).await?;

        let payload = codec::encode(ctx.namespace(), &event)?;
        let (partition, offset) = self.topic.append(event.aggregate_id(), payload);

        debug!(partition, offset, "Published event to channel");
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
        let member = self.topic.join(&group_id, self.config.start_offset);
        let consumer = Consumer {
            topic: Arc::clone(&self.topic),
            group_id: group_id.clone(),
            member,
            subscription: Subscription { matcher, handler },
            errors: self.errors.clone(),
        };
        let handle = tokio::spawn(consumer.run(self.cancel.subscribe()));
        lock(&self.consumers).push(handle);

        info!(group = %group_id, member, "Handler subscribed to channel bus");
        Ok(())
    }

    fn errors(&self) -> ErrorReceiver {
        self.errors.receiver()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.cancel.send(true);

        let consumers: Vec<JoinHandle<()>> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Channel consumer ended abnormally");
            }
        }

        info!(app_id = %self.config.app_id, "Channel event bus closed");
        Ok(())
    }
}

impl Drop for ChannelEventBus {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Receive loop of one group member.
struct Consumer {
    topic: Arc<Topic>,
    group_id: String,
    member: u64,
    subscription: Subscription,
    errors: ErrorChannel,
}

impl Consumer {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        let mut changed = self.topic.changed.subscribe();

        'consume: loop {
            changed.borrow_and_update();
            while let Some((partition, offset, payload)) = self.topic.next(&self.group_id, self.member) {
                if *cancel.borrow() {
                    break 'consume;
                }
                let result = dispatch::process_message(&payload, &self.subscription, &self.errors).await;
                debug!(
                    group = %self.group_id,
                    partition,
                    offset,
                    result = ?result,
                    "Processed channel message"
                );
                self.topic.commit(&self.group_id, self.member, partition, offset);
            }

            tokio::select! {
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                res = changed.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        self.topic.leave(&self.group_id, self.member);
        debug!(group = %self.group_id, member = self.member, "Channel consumer stopped");
    }
}
