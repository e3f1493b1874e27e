//! eventrelay - reliable event delivery for CQRS/ES
//!
//! Durable outboxes, per-tenant outbox multiplexing and pluggable event
//! buses (in-process channel, Kafka, NATS JetStream) delivering domain
//! events at-least-once and in per-aggregate order.

pub mod bus;
pub mod config;
pub mod context;
pub mod errors;
pub mod event;
pub mod handler;
pub mod matcher;
pub mod middleware;
pub mod namespace;
pub mod outbox;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use context::{Cancelled, Context};
pub use event::{AggregateRef, AggregateType, Event, EventType};
pub use handler::{EventHandler, HandlerError, HandlerType};
pub use matcher::Matcher;
