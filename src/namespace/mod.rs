//! Per-namespace outbox multiplexing.
//!
//! [`NamespaceOutbox`] routes every outbox operation to the outbox of the
//! namespace carried by the call's [`Context`]. Outboxes are created lazily
//! through a factory; handlers registered on the multiplexer are replayed,
//! in registration order, onto each new outbox before any event reaches it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::errors::{ErrorChannel, ErrorReceiver, DEFAULT_ERROR_CAPACITY};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerType};
use crate::matcher::Matcher;
use crate::outbox::{Outbox, OutboxError, Result};

/// Namespace used when the context carries none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Creates the outbox for a namespace.
pub type OutboxFactory =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn Outbox>>> + Send + Sync>;

/// Namespace multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespaces created eagerly at startup.
    pub preregister: Vec<String>,
    /// Capacity of the multiplexer's error channel.
    pub error_channel_capacity: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            preregister: Vec::new(),
            error_channel_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

#[derive(Clone)]
struct Registration {
    matcher: Matcher,
    handler: Arc<dyn EventHandler>,
}

/// Outbox that multiplexes per-namespace outboxes.
pub struct NamespaceOutbox {
    factory: OutboxFactory,
    outboxes: RwLock<HashMap<String, Arc<dyn Outbox>>>,
    /// Serializes namespace creation and handler registration.
    creation: tokio::sync::Mutex<()>,
    registrations: Mutex<Vec<Registration>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    preregister: Vec<String>,
    errors: ErrorChannel,
    started: AtomicBool,
    closed: AtomicBool,
}

impl NamespaceOutbox {
    pub fn new(factory: OutboxFactory) -> Self {
        Self::with_config(factory, &NamespaceConfig::default())
    }

    pub fn with_config(factory: OutboxFactory, config: &NamespaceConfig) -> Self {
        Self {
            factory,
            outboxes: RwLock::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
            registrations: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
            preregister: config.preregister.clone(),
            errors: ErrorChannel::new(config.error_channel_capacity),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Create the outbox for `namespace` now. Idempotent.
    pub async fn pre_register_namespace(&self, namespace: &str) -> Result<()> {
        self.outbox(namespace).await.map(|_| ())
    }

    /// Create the outboxes of every namespace listed in the configuration.
    ///
    /// Call after registering handlers so each outbox starts with them.
    pub async fn pre_register_configured(&self) -> Result<()> {
        for namespace in &self.preregister {
            self.pre_register_namespace(namespace).await?;
        }
        Ok(())
    }

    /// Namespaces with an existing outbox.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.read_outboxes().keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// The outbox for `namespace`, creating it on first use.
    pub async fn outbox(&self, namespace: &str) -> Result<Arc<dyn Outbox>> {
        if let Some(outbox) = self.read_outboxes().get(namespace) {
            return Ok(Arc::clone(outbox));
        }

        let _creation = self.creation.lock().await;
        if let Some(outbox) = self.read_outboxes().get(namespace) {
            return Ok(Arc::clone(outbox));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(OutboxError::Closed);
        }

        let outbox = self
            .create(namespace)
            .await
            .map_err(|source| OutboxError::Namespace {
                namespace: namespace.to_string(),
                source: Box::new(source),
            })?;

        self.write_outboxes()
            .insert(namespace.to_string(), Arc::clone(&outbox));
        if self.started.load(Ordering::SeqCst) {
            outbox.start();
        }

        info!(namespace, "Namespace outbox created");
        Ok(outbox)
    }

    /// Build and prepare an outbox. Caller holds the creation lock.
    async fn create(&self, namespace: &str) -> Result<Arc<dyn Outbox>> {
        let outbox = (self.factory)(namespace.to_string()).await?;

        let ctx = Context::new().with_namespace(namespace);
        let registrations = self.registrations_snapshot();
        for registration in registrations {
            if let Err(e) = outbox
                .add_handler(&ctx, registration.matcher, registration.handler)
                .await
            {
                if let Err(close_err) = outbox.close().await {
                    warn!(namespace, error = %close_err, "Failed to close discarded outbox");
                }
                return Err(e);
            }
        }

        self.spawn_forwarder(namespace, outbox.errors());
        Ok(outbox)
    }

    fn spawn_forwarder(&self, namespace: &str, source: ErrorReceiver) {
        let errors = self.errors.clone();
        let namespace = namespace.to_string();
        let handle = tokio::spawn(async move {
            while let Some(err) = source.recv().await {
                errors.forward(err);
            }
            debug!(namespace = %namespace, "Error forwarder finished");
        });
        lock(&self.forwarders).push(handle);
    }

    fn registrations_snapshot(&self) -> Vec<Registration> {
        lock(&self.registrations).clone()
    }

    fn named_outboxes(&self) -> Vec<(String, Arc<dyn Outbox>)> {
        self.read_outboxes()
            .iter()
            .map(|(ns, outbox)| (ns.clone(), Arc::clone(outbox)))
            .collect()
    }

    fn all_outboxes(&self) -> Vec<Arc<dyn Outbox>> {
        self.read_outboxes().values().cloned().collect()
    }

    fn read_outboxes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Outbox>>> {
        self.outboxes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_outboxes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Outbox>>> {
        self.outboxes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Outbox for NamespaceOutbox {
    async fn add_handler(
        &self,
        _ctx: &Context,
        matcher: Matcher,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OutboxError::Closed);
        }

        let _creation = self.creation.lock().await;
        let handler_type = handler.handler_type();
        if lock(&self.registrations)
            .iter()
            .any(|r| r.handler.handler_type() == handler_type)
        {
            return Err(OutboxError::HandlerAlreadyAdded(handler_type));
        }

        // All existing outboxes get the handler, or none keeps it.
        let outboxes = self.named_outboxes();
        let mut applied: Vec<(String, Arc<dyn Outbox>)> = Vec::with_capacity(outboxes.len());
        for (namespace, outbox) in outboxes {
            let ctx = Context::new().with_namespace(namespace.as_str());
            if let Err(source) = outbox
                .add_handler(&ctx, matcher.clone(), Arc::clone(&handler))
                .await
            {
                warn!(
                    namespace = %namespace,
                    handler = %handler_type,
                    error = %source,
                    "Namespace outbox rejected handler, rolling back"
                );
                for (applied_ns, applied_outbox) in applied {
                    let ctx = Context::new().with_namespace(applied_ns.as_str());
                    if let Err(e) = applied_outbox.remove_handler(&ctx, &handler_type).await {
                        warn!(namespace = %applied_ns, error = %e, "Failed to roll back handler");
                    }
                }
                return Err(OutboxError::Namespace {
                    namespace,
                    source: Box::new(source),
                });
            }
            applied.push((namespace, outbox));
        }

        lock(&self.registrations).push(Registration { matcher, handler });

        info!(handler = %handler_type, "Handler added to namespace outbox");
        Ok(())
    }

    async fn remove_handler(&self, _ctx: &Context, handler_type: &HandlerType) -> Result<bool> {
        let _creation = self.creation.lock().await;
        let removed = {
            let mut registrations = lock(&self.registrations);
            let before = registrations.len();
            registrations.retain(|r| &r.handler.handler_type() != handler_type);
            registrations.len() != before
        };

        for (namespace, outbox) in self.named_outboxes() {
            let ctx = Context::new().with_namespace(namespace.as_str());
            outbox.remove_handler(&ctx, handler_type).await?;
        }
        Ok(removed)
    }

    async fn enqueue(&self, ctx: &Context, event: Event) -> Result<()> {
        let outbox = self.outbox(ctx.namespace()).await?;
        outbox.enqueue(ctx, event).await
    }

    fn start(&self) {
        if self.closed.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for outbox in self.all_outboxes() {
            outbox.start();
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let _creation = self.creation.lock().await;
        let outboxes: Vec<(String, Arc<dyn Outbox>)> = self.write_outboxes().drain().collect();

        let mut first_error = None;
        for (namespace, outbox) in outboxes {
            if let Err(e) = outbox.close().await {
                warn!(namespace = %namespace, error = %e, "Failed to close namespace outbox");
                first_error.get_or_insert(OutboxError::Namespace {
                    namespace,
                    source: Box::new(e),
                });
            }
        }

        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }

        info!("Namespace outbox closed");
        first_error.map_or(Ok(()), Err)
    }

    fn errors(&self) -> ErrorReceiver {
        self.errors.receiver()
    }
}

impl Drop for NamespaceOutbox {
    fn drop(&mut self) {
        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }
    }
}
