//! SQLite outbox store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Cond, Expr, Iden, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use super::{ClaimQuery, EntryState, OutboxEntry, OutboxStore, StoreError};

#[derive(Iden)]
enum Outbox {
    #[iden = "outbox"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "namespace"]
    Namespace,
    #[iden = "event"]
    Event,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "state"]
    State,
    #[iden = "attempts"]
    Attempts,
    #[iden = "last_attempt"]
    LastAttempt,
    #[iden = "taken_at"]
    TakenAt,
    #[iden = "delivered_to"]
    DeliveredTo,
}

const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY NOT NULL,
    namespace TEXT NOT NULL,
    event TEXT NOT NULL,
    created_at TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt TEXT,
    taken_at TEXT NOT NULL,
    delivered_to TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_outbox_state_taken ON outbox(state, taken_at);
"#;

/// Timestamps are stored as fixed-width RFC 3339 so that string comparison
/// orders them and claim tokens compare exactly.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp '{s}': {e}")))
}

/// SQLite implementation of [`OutboxStore`].
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and create the outbox table if needed.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(url).await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Create the outbox table if needed.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    fn columns() -> [Outbox; 9] {
        [
            Outbox::Id,
            Outbox::Namespace,
            Outbox::Event,
            Outbox::CreatedAt,
            Outbox::State,
            Outbox::Attempts,
            Outbox::LastAttempt,
            Outbox::TakenAt,
            Outbox::DeliveredTo,
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<OutboxEntry, StoreError> {
        let id: String = row.try_get("id")?;
        let event: String = row.try_get("event")?;
        let created_at: String = row.try_get("created_at")?;
        let state: String = row.try_get("state")?;
        let attempts: i64 = row.try_get("attempts")?;
        let last_attempt: Option<String> = row.try_get("last_attempt")?;
        let taken_at: String = row.try_get("taken_at")?;
        let delivered_to: String = row.try_get("delivered_to")?;

        Ok(OutboxEntry {
            id: Uuid::parse_str(&id).map_err(|e| StoreError::Backend(e.to_string()))?,
            namespace: row.try_get("namespace")?,
            event: serde_json::from_str(&event)?,
            created_at: parse_timestamp(&created_at)?,
            state: state.parse().map_err(StoreError::Backend)?,
            attempts: attempts as u32,
            last_attempt: last_attempt.as_deref().map(parse_timestamp).transpose()?,
            taken_at: parse_timestamp(&taken_at)?,
            delivered_to: serde_json::from_str(&delivered_to)?,
        })
    }

    async fn claim_in(
        conn: &mut SqliteConnection,
        query: &ClaimQuery,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let select = Query::select()
            .columns(Self::columns())
            .from(Outbox::Table)
            .cond_where(
                Cond::any()
                    .add(
                        Cond::all()
                            .add(Expr::col(Outbox::State).eq(EntryState::Pending.as_str()))
                            .add(Expr::col(Outbox::TakenAt).lt(timestamp(query.pending_before))),
                    )
                    .add(
                        Cond::all()
                            .add(Expr::col(Outbox::State).eq(EntryState::InFlight.as_str()))
                            .add(Expr::col(Outbox::TakenAt).lt(timestamp(query.lease_before))),
                    ),
            )
            .order_by(Outbox::CreatedAt, Order::Asc)
            .limit(query.limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&mut *conn).await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = Self::from_row(row)?;

            let update = Query::update()
                .table(Outbox::Table)
                .values([
                    (Outbox::State, EntryState::InFlight.as_str().into()),
                    (Outbox::TakenAt, timestamp(query.now).into()),
                ])
                .and_where(Expr::col(Outbox::Id).eq(entry.id.to_string()))
                .and_where(Expr::col(Outbox::TakenAt).eq(timestamp(entry.taken_at)))
                .to_string(SqliteQueryBuilder);

            let result = sqlx::query(&update).execute(&mut *conn).await?;
            if result.rows_affected() == 1 {
                entry.state = EntryState::InFlight;
                entry.taken_at = query.now;
                claimed.push(entry);
            }
        }

        Ok(claimed)
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn insert(&self, entry: &OutboxEntry) -> Result<(), StoreError> {
        let query = Query::insert()
            .into_table(Outbox::Table)
            .columns(Self::columns())
            .values_panic([
                entry.id.to_string().into(),
                entry.namespace.clone().into(),
                serde_json::to_string(&entry.event)?.into(),
                timestamp(entry.created_at).into(),
                entry.state.as_str().into(),
                i64::from(entry.attempts).into(),
                entry.last_attempt.map(timestamp).into(),
                timestamp(entry.taken_at).into(),
                serde_json::to_string(&entry.delivered_to)?.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn claim_stale(&self, query: &ClaimQuery) -> Result<Vec<OutboxEntry>, StoreError> {
        // BEGIN IMMEDIATE takes the write lock up front so two sweepers
        // cannot select the same rows.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::claim_in(&mut conn, query).await {
            Ok(claimed) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(claimed)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(error = %rollback, "Failed to roll back outbox claim");
                }
                Err(e)
            }
        }
    }

    async fn release(&self, entry: &OutboxEntry, claimed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let claim = Cond::all()
            .add(Expr::col(Outbox::Id).eq(entry.id.to_string()))
            .add(Expr::col(Outbox::State).eq(EntryState::InFlight.as_str()))
            .add(Expr::col(Outbox::TakenAt).eq(timestamp(claimed_at)));

        let query = if entry.state == EntryState::Delivered {
            Query::delete()
                .from_table(Outbox::Table)
                .cond_where(claim)
                .to_string(SqliteQueryBuilder)
        } else {
            Query::update()
                .table(Outbox::Table)
                .values([
                    (Outbox::State, entry.state.as_str().into()),
                    (Outbox::Attempts, i64::from(entry.attempts).into()),
                    (Outbox::LastAttempt, entry.last_attempt.map(timestamp).into()),
                    (Outbox::TakenAt, timestamp(entry.taken_at).into()),
                    (
                        Outbox::DeliveredTo,
                        serde_json::to_string(&entry.delivered_to)?.into(),
                    ),
                ])
                .cond_where(claim)
                .to_string(SqliteQueryBuilder)
        };

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimLost(entry.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError> {
        let query = Query::select()
            .columns(Self::columns())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn count(&self, state: EntryState) -> Result<usize, StoreError> {
        let query = Query::select()
            .expr(Expr::col(Outbox::Id).count())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::State).eq(state.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }
}
