//! Ephemeral delivery.
//!
//! Handlers wrapped by this middleware are invoked directly when an event is
//! enqueued and are never part of an outbox entry's durable bookkeeping: a
//! failure is reported but not retried. Matching and the other handlers of
//! the outbox are unaffected.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::EventHandlerMiddleware;
use crate::context::Context;
use crate::event::Event;
use crate::handler::{EventHandler, HandlerError, HandlerType};

/// Middleware marking handlers as ephemeral.
pub fn middleware() -> EventHandlerMiddleware {
    Arc::new(|handler| Arc::new(EphemeralHandler::new(handler)) as Arc<dyn EventHandler>)
}

/// Fire-and-forget wrapper around another handler.
pub struct EphemeralHandler {
    inner: Arc<dyn EventHandler>,
}

impl EphemeralHandler {
    pub fn new(inner: Arc<dyn EventHandler>) -> Self {
        Self { inner }
    }
}

impl EventHandler for EphemeralHandler {
    fn handler_type(&self) -> HandlerType {
        self.inner.handler_type()
    }

    fn handle(&self, ctx: Context, event: Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.inner.handle(ctx, event)
    }

    fn inner_handler(&self) -> Option<Arc<dyn EventHandler>> {
        Some(Arc::clone(&self.inner))
    }

    fn is_ephemeral(&self) -> bool {
        true
    }
}
