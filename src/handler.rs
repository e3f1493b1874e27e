//! Event handler contract and registration bookkeeping.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::context::Context;
use crate::event::Event;
use crate::matcher::Matcher;

/// Stable identity of a handler.
///
/// Used as the durable consumer / subscription name by brokers and to record
/// which handlers an outbox entry has already been delivered to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct HandlerType(String);

impl HandlerType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Error returned by a handler while processing an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler '{handler}' failed: {message}")]
    Failed { handler: HandlerType, message: String },

    #[error("handler '{handler}' cancelled: {source}")]
    Cancelled {
        handler: HandlerType,
        #[source]
        source: crate::context::Cancelled,
    },
}

impl HandlerError {
    pub fn failed(handler: HandlerType, message: impl Into<String>) -> Self {
        Self::Failed {
            handler,
            message: message.into(),
        }
    }

    pub fn handler(&self) -> &HandlerType {
        match self {
            Self::Failed { handler, .. } | Self::Cancelled { handler, .. } => handler,
        }
    }
}

/// Handler for processing delivered events.
pub trait EventHandler: Send + Sync {
    /// Stable identity of this handler.
    fn handler_type(&self) -> HandlerType;

    /// Process an event.
    ///
    /// The event is wrapped in `Arc` so all handlers share one immutable value.
    fn handle(&self, ctx: Context, event: Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>>;

    /// The wrapped handler, for middleware that decorates another handler.
    fn inner_handler(&self) -> Option<Arc<dyn EventHandler>> {
        None
    }

    /// Whether events for this handler bypass durable staging.
    fn is_ephemeral(&self) -> bool {
        false
    }
}

/// One matcher + handler pair.
#[derive(Clone)]
pub struct Registration {
    pub matcher: Matcher,
    pub handler: Arc<dyn EventHandler>,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("matcher", &self.matcher)
            .field("handler", &self.handler.handler_type())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Ordered list of handler registrations.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `false` if the handler type is already
    /// registered.
    pub async fn add(&self, matcher: Matcher, handler: Arc<dyn EventHandler>) -> bool {
        let mut registrations = self.registrations.write().await;
        let handler_type = handler.handler_type();
        if registrations
            .iter()
            .any(|r| r.handler.handler_type() == handler_type)
        {
            return false;
        }
        registrations.push(Registration {
            matcher,
            handler,
            registered_at: Utc::now(),
        });
        true
    }

    /// Remove the registration of `handler_type`, if any.
    pub async fn remove(&self, handler_type: &HandlerType) -> bool {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|r| &r.handler.handler_type() != handler_type);
        registrations.len() != before
    }

    /// Snapshot of registrations whose matcher accepts `event`.
    ///
    /// The lock is released before returning so callers can invoke handlers
    /// without holding it.
    pub async fn matching(&self, event: &Event) -> Vec<Registration> {
        self.registrations
            .read()
            .await
            .iter()
            .filter(|r| r.matcher.matches(event))
            .cloned()
            .collect()
    }

    /// Snapshot of all registrations, in registration order.
    pub async fn all(&self) -> Vec<Registration> {
        self.registrations.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_event, RecordingHandler};

    #[tokio::test]
    async fn test_registry_rejects_duplicate_handler_type() {
        let registry = HandlerRegistry::new();
        assert!(registry.add(Matcher::All, RecordingHandler::new("h").into_arc()).await);
        assert!(!registry.add(Matcher::All, RecordingHandler::new("h").into_arc()).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_registry_remove() {
        let registry = HandlerRegistry::new();
        registry.add(Matcher::All, RecordingHandler::new("h").into_arc()).await;

        assert!(registry.remove(&HandlerType::new("h")).await);
        assert!(!registry.remove(&HandlerType::new("h")).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registry_matching_preserves_order() {
        let registry = HandlerRegistry::new();
        registry.add(Matcher::All, RecordingHandler::new("first").into_arc()).await;
        registry
            .add(Matcher::events(["Other"]), RecordingHandler::new("skipped").into_arc())
            .await;
        registry.add(Matcher::All, RecordingHandler::new("second").into_arc()).await;

        let matching = registry.matching(&make_event("Test", 1)).await;
        let names: Vec<_> = matching
            .iter()
            .map(|r| r.handler.handler_type().as_str().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
