//! Handler middleware.
//!
//! A middleware wraps a handler and returns a handler. Chains are applied at
//! registration time; the wrapped handler stays reachable through
//! [`EventHandler::inner_handler`].

pub mod ephemeral;

use std::sync::Arc;

use crate::handler::EventHandler;

/// Handler-transforming function.
pub type EventHandlerMiddleware =
    Arc<dyn Fn(Arc<dyn EventHandler>) -> Arc<dyn EventHandler> + Send + Sync>;

/// Wrap `handler` in `middleware`, the first middleware becoming the
/// outermost layer.
pub fn use_middleware(
    handler: Arc<dyn EventHandler>,
    middleware: &[EventHandlerMiddleware],
) -> Arc<dyn EventHandler> {
    middleware
        .iter()
        .rev()
        .fold(handler, |inner, mw| mw(inner))
}

/// Whether any layer of the handler chain marks delivery as ephemeral.
pub fn is_ephemeral(handler: &dyn EventHandler) -> bool {
    if handler.is_ephemeral() {
        return true;
    }
    let mut current = handler.inner_handler();
    while let Some(h) = current {
        if h.is_ephemeral() {
            return true;
        }
        current = h.inner_handler();
    }
    false
}

/// The innermost handler of a middleware chain.
pub fn innermost(handler: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
    let mut current = handler;
    while let Some(inner) = current.inner_handler() {
        current = inner;
    }
    current
}
