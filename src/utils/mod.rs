//! Shared helpers: logging bootstrap and backoff policies.

pub mod bootstrap;
pub mod retry;
