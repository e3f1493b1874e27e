//! Event matchers select which events a handler registration receives.

use crate::event::{AggregateType, Event, EventType};

/// Predicate over event metadata.
///
/// Matching is pure and total: it never fails and has no side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Matches every event.
    All,
    /// Matches events whose type is one of the listed types.
    Events(Vec<EventType>),
    /// Matches events whose aggregate type is one of the listed types.
    Aggregates(Vec<AggregateType>),
    /// Matches when any inner matcher matches.
    Any(Vec<Matcher>),
    /// Matches when every inner matcher matches.
    Every(Vec<Matcher>),
}

impl Matcher {
    pub fn events<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        Self::Events(types.into_iter().map(Into::into).collect())
    }

    pub fn aggregates<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        Self::Aggregates(types.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Events(types) => types.iter().any(|t| t == event.event_type()),
            Self::Aggregates(types) => types.iter().any(|t| t == event.aggregate_type()),
            Self::Any(matchers) => matchers.iter().any(|m| m.matches(event)),
            Self::Every(matchers) => matchers.iter().all(|m| m.matches(event)),
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::All
    }
}
