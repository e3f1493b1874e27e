//! Wire format shared by the bus adapters.
//!
//! Messages are JSON envelopes `{"namespace": ..., "event": ...}`. The
//! receiver restores the namespace into the handler's [`Context`].

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::event::Event;

use super::Result;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    namespace: &'a str,
    event: &'a Event,
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub namespace: String,
    pub event: Event,
}

impl Envelope {
    /// Context a handler receives this event with.
    pub fn context(&self) -> Context {
        Context::new().with_namespace(self.namespace.clone())
    }
}

pub fn encode(namespace: &str, event: &Event) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&EnvelopeRef { namespace, event })?)
}

pub fn decode(payload: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(payload)?)
}
