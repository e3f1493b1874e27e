use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;
use crate::handler::HandlerType;

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for (re)delivery.
    Pending,
    /// Claimed by exactly one delivery attempt.
    InFlight,
    /// Delivered to every matching handler.
    Delivered,
    /// Dead-lettered after exhausting the attempt budget.
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outbox entry state: {other}")),
        }
    }
}

/// One event staged for delivery plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub namespace: String,
    pub event: Event,
    pub created_at: DateTime<Utc>,
    pub state: EntryState,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Time of the last claim or release. Doubles as the claim token: a
    /// release only applies while the stored value is unchanged.
    pub taken_at: DateTime<Utc>,
    /// Handlers that already processed the event successfully.
    pub delivered_to: Vec<HandlerType>,
}

impl OutboxEntry {
    /// New entry, claimed by the caller for immediate delivery.
    pub fn new(namespace: impl Into<String>, event: Event, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            event,
            created_at: now,
            state: EntryState::InFlight,
            attempts: 0,
            last_attempt: None,
            taken_at: now,
            delivered_to: Vec::new(),
        }
    }

    pub fn is_delivered_to(&self, handler: &HandlerType) -> bool {
        self.delivered_to.contains(handler)
    }

    /// Whether a sweep with the given cutoffs may claim this entry.
    pub fn is_claimable(&self, pending_before: DateTime<Utc>, lease_before: DateTime<Utc>) -> bool {
        match self.state {
            EntryState::Pending => self.taken_at < pending_before,
            EntryState::InFlight => self.taken_at < lease_before,
            EntryState::Delivered | EntryState::Failed => false,
        }
    }
}
