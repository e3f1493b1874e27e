//! Handler dispatch shared by the bus receive loops.
//!
//! Every receive loop owns one subscription for one handler. A message is
//! decoded, filtered by the subscription's matcher and handed to the
//! handler; failures go to the bus error channel.

use std::sync::Arc;

use tracing::debug;

use super::{codec, BusError};
use crate::errors::{DeliveryError, ErrorChannel};
use crate::handler::EventHandler;
use crate::matcher::Matcher;

/// A handler subscribed through a bus.
#[derive(Clone)]
pub struct Subscription {
    pub matcher: Matcher,
    pub handler: Arc<dyn EventHandler>,
}

/// Result of processing a message through a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handler succeeded, or the matcher filtered the event out.
    Success,
    /// The handler failed, consider redelivery.
    HandlerFailed,
    /// Message could not be decoded, no retry will help.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if the message should be acknowledged (removed from queue).
    ///
    /// Decode errors are acked to prevent infinite redelivery of bad messages.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Success | Self::DecodeError)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Decode `payload` and deliver it to `subscription`.
pub async fn process_message(
    payload: &[u8],
    subscription: &Subscription,
    errors: &ErrorChannel,
) -> DispatchResult {
    let envelope = match codec::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            errors.report(DeliveryError::new(e, "", None));
            return DispatchResult::DecodeError;
        }
    };

    if !subscription.matcher.matches(&envelope.event) {
        return DispatchResult::Success;
    }

    let ctx = envelope.context();
    let event = Arc::new(envelope.event);
    debug!(
        handler = %subscription.handler.handler_type(),
        namespace = %envelope.namespace,
        event = %event,
        "Dispatching event from bus"
    );

    match subscription.handler.handle(ctx, Arc::clone(&event)).await {
        Ok(()) => DispatchResult::Success,
        Err(e) => {
            errors.report(DeliveryError::new(e, envelope.namespace, Some(event)));
            DispatchResult::HandlerFailed
        }
    }
}

/// Report a transport failure on the bus error channel.
pub fn report_transport(errors: &ErrorChannel, err: BusError) {
    errors.report(DeliveryError::new(err, "", None));
}
