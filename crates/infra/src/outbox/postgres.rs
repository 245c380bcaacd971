//! Postgres-backed outbox.
//!
//! Schema: `migrations/0001_outbox.sql`.
//!
//! ## Writing
//!
//! [`enqueue`] takes the caller's `sqlx::Transaction`, so the outbox row commits
//! with the business rows written in that transaction. The aggregate version
//! comes from an upsert on `outbox_aggregate_versions`, which row-locks the
//! aggregate until commit; concurrent writers to one aggregate serialize there.
//!
//! ## Claiming
//!
//! Claims run in their own transaction holding a transaction-scoped advisory
//! lock, so two relays never evaluate the head-of-aggregate rule against the
//! same snapshot. A row is skipped when an earlier unsent row of its aggregate
//! is leased or backing off.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `CommitFailed` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Io / other | N/A | `Backend` |
//!
//! ## Sync Bridge
//!
//! [`OutboxStore`] is synchronous (the relay runs on a plain thread). The
//! trait impl blocks on the runtime handle captured at construction, so it
//! must not be called from inside that runtime's worker threads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use bidbus_core::{AggregateId, MessageId};

use super::{OutboxMessage, OutboxStore, later};
use crate::store::StoreError;

const CLAIM_LOCK_KEY: i64 = 0x6269_6462_7573; // "bidbus"

const OUTBOX_COLUMNS: &str = "id, aggregate_id, aggregate_version, message_type, payload, \
     causation_id, created_at, sent_at, attempts, claimed_by, claimed_until, next_attempt_at, \
     last_error";

/// Queue a message inside the caller's Postgres transaction.
#[instrument(skip(tx, payload), fields(aggregate_id = %aggregate_id), err)]
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
    message_type: &str,
    payload: JsonValue,
    causation_id: Option<MessageId>,
) -> Result<MessageId, StoreError> {
    let version: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO outbox_aggregate_versions (aggregate_id, version)
        VALUES ($1, 1)
        ON CONFLICT (aggregate_id)
        DO UPDATE SET version = outbox_aggregate_versions.version + 1
        RETURNING version
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("enqueue", e))?;

    let id = MessageId::new();
    sqlx::query(
        r#"
        INSERT INTO outbox (id, aggregate_id, aggregate_version, message_type, payload,
                            causation_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .bind(version)
    .bind(message_type)
    .bind(&payload)
    .bind(causation_id.map(Uuid::from))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("enqueue", e))?;

    Ok(id)
}

/// Apply `migrations/0001_outbox.sql`.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(include_str!("../../migrations/0001_outbox.sql"))
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Outbox store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self), err)]
    pub async fn claim_batch_async(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT o.position
                FROM outbox o
                WHERE o.sent_at IS NULL
                  AND (o.claimed_until IS NULL OR o.claimed_until <= $3)
                  AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= $3)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox e
                      WHERE e.aggregate_id = o.aggregate_id
                        AND e.position < o.position
                        AND e.sent_at IS NULL
                        AND ((e.claimed_until IS NOT NULL AND e.claimed_until > $3)
                          OR (e.next_attempt_at IS NOT NULL AND e.next_attempt_at > $3))
                  )
                ORDER BY o.position
                LIMIT $4
            )
            UPDATE outbox
            SET claimed_by = $1, claimed_until = $2
            FROM candidates
            WHERE outbox.position = candidates.position
            RETURNING outbox.position, {OUTBOX_COLUMNS}
            "#
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(relay_id)
            .bind(later(now, lease))
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let position: i64 = row
                .try_get("position")
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            claimed.push((position, message_from_row(row)?));
        }
        claimed.sort_by_key(|(position, _)| *position);
        Ok(claimed.into_iter().map(|(_, m)| m).collect())
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    pub async fn mark_sent_async(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET sent_at = COALESCE(sent_at, $2), claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownMessage(id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(message_id = %id), err)]
    pub async fn record_failure_async(
        &self,
        id: MessageId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3,
                claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(retry_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        let attempts = attempts.ok_or(StoreError::UnknownMessage(id))?;
        Ok(u32::try_from(attempts).unwrap_or(0))
    }

    pub async fn release_async(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET claimed_by = NULL, claimed_until = NULL WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownMessage(id));
        }
        Ok(())
    }

    pub async fn get_async(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn pending_count_async(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE sent_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_count", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub async fn purge_sent_before_async(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM outbox WHERE sent_at IS NOT NULL AND sent_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_sent_before", e))?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        self.runtime
            .block_on(self.claim_batch_async(relay_id, limit, lease, now))
    }

    fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.runtime.block_on(self.mark_sent_async(id, sent_at))
    }

    fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.runtime
            .block_on(self.record_failure_async(id, error, retry_at))
    }

    fn release(&self, id: MessageId) -> Result<(), StoreError> {
        self.runtime.block_on(self.release_async(id))
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        self.runtime.block_on(self.get_async(id))
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        self.runtime.block_on(self.pending_count_async())
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.runtime.block_on(self.purge_sent_before_async(cutoff))
    }
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    let get_err = |e: sqlx::Error| map_sqlx_error("decode row", e);

    let version: i64 = row.try_get("aggregate_version").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(get_err)?;
    let causation: Option<Uuid> = row.try_get("causation_id").map_err(get_err)?;

    Ok(OutboxMessage {
        id: MessageId::from_uuid(row.try_get("id").map_err(get_err)?),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(get_err)?),
        aggregate_version: u64::try_from(version)
            .map_err(|_| StoreError::Backend(format!("negative aggregate_version {version}")))?,
        message_type: row.try_get("message_type").map_err(get_err)?,
        payload: row.try_get("payload").map_err(get_err)?,
        causation_id: causation.map(MessageId::from_uuid),
        created_at: row.try_get("created_at").map_err(get_err)?,
        sent_at: row.try_get("sent_at").map_err(get_err)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        claimed_by: row.try_get("claimed_by").map_err(get_err)?,
        claimed_until: row.try_get("claimed_until").map_err(get_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(get_err)?,
        last_error: row.try_get("last_error").map_err(get_err)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::CommitFailed(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Backend(format!("{} failed: {}", operation, other)),
    }
}
