use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{EntryState, OutboxEntry};

/// Errors raised by outbox stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("claim on outbox entry {0} was lost")]
    ClaimLost(Uuid),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Which entries a sweep may claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimQuery {
    /// Pending entries taken before this instant are stale.
    pub pending_before: DateTime<Utc>,
    /// In-flight entries taken before this instant have an expired claim.
    pub lease_before: DateTime<Utc>,
    /// New `taken_at` of claimed entries.
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// Durable storage for outbox entries.
///
/// Claiming and releasing are the only state transitions; both must be
/// atomic so an entry is in flight in at most one delivery attempt.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Durably record a new entry. The entry arrives already claimed.
    async fn insert(&self, entry: &OutboxEntry) -> Result<(), StoreError>;

    /// Claim up to `query.limit` stale entries, oldest first, marking them
    /// in flight with `taken_at = query.now`.
    async fn claim_stale(&self, query: &ClaimQuery) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Persist the outcome of a delivery attempt and release the claim held
    /// since `claimed_at`. `Delivered` entries are removed.
    async fn release(&self, entry: &OutboxEntry, claimed_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError>;

    async fn count(&self, state: EntryState) -> Result<usize, StoreError>;
}

/// In-memory outbox store.
///
/// Durable for the lifetime of the process only; suited to tests and
/// single-process deployments.
#[derive(Default)]
pub struct MemoryOutboxStore {
    entries: Mutex<HashMap<Uuid, OutboxEntry>>,
    fail_on_insert: AtomicBool,
    inserts: AtomicUsize,
    fail_nth: AtomicUsize,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent inserts fail, simulating an unavailable store.
    pub fn set_fail_on_insert(&self, fail: bool) {
        self.fail_on_insert.store(fail, Ordering::SeqCst);
    }

    /// Make only the `n`th insert from now on fail, counting from 1.
    pub fn fail_nth_insert(&self, n: usize) {
        self.inserts.store(0, Ordering::SeqCst);
        self.fail_nth.store(n, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert(&self, entry: &OutboxEntry) -> Result<(), StoreError> {
        let seen = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_insert.load(Ordering::SeqCst) || seen == self.fail_nth.load(Ordering::SeqCst)
        {
            return Err(StoreError::Backend("memory store insert disabled".to_string()));
        }
        self.entries.lock().await.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn claim_stale(&self, query: &ClaimQuery) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut entries = self.entries.lock().await;

        let mut stale: Vec<&mut OutboxEntry> = entries
            .values_mut()
            .filter(|e| e.is_claimable(query.pending_before, query.lease_before))
            .collect();
        stale.sort_by_key(|e| e.created_at);

        Ok(stale
            .into_iter()
            .take(query.limit)
            .map(|e| {
                e.state = EntryState::InFlight;
                e.taken_at = query.now;
                e.clone()
            })
            .collect())
    }

    async fn release(&self, entry: &OutboxEntry, claimed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;

        match entries.get(&entry.id) {
            Some(stored) if stored.state == EntryState::InFlight && stored.taken_at == claimed_at => {}
            _ => return Err(StoreError::ClaimLost(entry.id)),
        }

        if entry.state == EntryState::Delivered {
            entries.remove(&entry.id);
        } else {
            entries.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(self.entries.lock().await.get(&id).cloned())
    }

    async fn count(&self, state: EntryState) -> Result<usize, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.state == state)
            .count())
    }
}
