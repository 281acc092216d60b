//! Postgres backends for the relay outbox and idempotency stores.
//!
//! The outbox table carries a `version` column; every mutation is a
//! compare-and-swap (`WHERE id = .. AND version = ..`), so concurrent
//! dispatcher instances surface lost races as conflicts instead of
//! overwriting each other.

use async_trait::async_trait;
use relay_core::prelude::*;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

fn storage_err(e: sqlx::Error) -> RelayError {
    RelayError::Storage(e.to_string())
}

const ENTRY_COLUMNS: &str = "id, message_type, payload, status, created_at, dispatched_at, \
     retry_count, correlation_id, last_error, next_retry_at, abandoned_at, version";

fn entry_from_row(row: &PgRow) -> Result<OutboxEntry, RelayError> {
    let status: String = row.try_get("status").map_err(storage_err)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(storage_err)?;
    Ok(OutboxEntry {
        id: EntryId::from(row.try_get::<Uuid, _>("id").map_err(storage_err)?),
        message_type: MessageType::new(
            row.try_get::<String, _>("message_type").map_err(storage_err)?,
        ),
        payload: Payload::new(
            row.try_get::<serde_json::Value, _>("payload")
                .map_err(storage_err)?,
        ),
        status: EntryStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        dispatched_at: row.try_get("dispatched_at").map_err(storage_err)?,
        retry_count: retry_count as u32,
        correlation_id: CorrelationId::new(
            row.try_get::<String, _>("correlation_id")
                .map_err(storage_err)?,
        ),
        last_error: row.try_get("last_error").map_err(storage_err)?,
        next_retry_at: row.try_get("next_retry_at").map_err(storage_err)?,
        abandoned_at: row.try_get("abandoned_at").map_err(storage_err)?,
        version: Version::new(row.try_get::<i64, _>("version").map_err(storage_err)?),
    })
}

pub struct PostgresOutboxStore {
    pool: PgPool,
    policy: OutboxRetryPolicy,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, policy: OutboxRetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Storage`] if the database is unreachable or
    /// a migration fails to apply.
    pub async fn migrate(&self) -> Result<(), RelayError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))
    }

    async fn fetch(&self, id: EntryId) -> Result<OutboxEntry, RelayError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM relay_outbox WHERE id = $1"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        match row {
            Some(row) => entry_from_row(&row),
            None => Err(RelayError::NotFound(id)),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(
        &self,
        message_type: MessageType,
        payload: Payload,
        correlation_id: CorrelationId,
    ) -> Result<EntryId, RelayError> {
        let entry = OutboxEntry::new(message_type, payload, correlation_id);
        sqlx::query(
            "INSERT INTO relay_outbox \
                 (id, message_type, payload, status, created_at, retry_count, \
                  correlation_id, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(*entry.id.as_uuid())
        .bind(entry.message_type.as_str())
        .bind(entry.payload.as_json().clone())
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .bind(entry.retry_count as i32)
        .bind(entry.correlation_id.as_str())
        .bind(entry.version.as_i64())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(entry.id)
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>, RelayError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM relay_outbox \
             WHERE status IN ('Pending', 'Failed') \
             ORDER BY position, id \
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn mark_dispatched(
        &self,
        id: EntryId,
        expected_version: Version,
    ) -> Result<(), RelayError> {
        let result = sqlx::query(
            "UPDATE relay_outbox \
             SET status = 'Dispatched', dispatched_at = $3, version = version + 1 \
             WHERE id = $1 AND version = $2 AND status IN ('Pending', 'Failed')",
        )
        .bind(*id.as_uuid())
        .bind(expected_version.as_i64())
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            // Distinguish a missing entry from a lost race.
            self.fetch(id).await?;
            return Err(RelayError::Conflict(id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: EntryId,
        expected_version: Version,
        error_message: &str,
    ) -> Result<(), RelayError> {
        let entry = self.fetch(id).await?;
        if entry.version != expected_version {
            return Err(RelayError::Conflict(id));
        }

        let retry_count = entry.retry_count + 1;
        let now = OffsetDateTime::now_utc();
        let (status, next_retry_at, abandoned_at) = if retry_count > self.policy.max_retries {
            (EntryStatus::Abandoned, None, Some(now))
        } else {
            let backoff = self.policy.backoff(retry_count);
            (
                EntryStatus::Failed,
                Some(now + time::Duration::seconds_f64(backoff.as_secs_f64())),
                None,
            )
        };

        let result = sqlx::query(
            "UPDATE relay_outbox \
             SET status = $3, retry_count = $4, last_error = $5, \
                 next_retry_at = $6, abandoned_at = $7, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(*id.as_uuid())
        .bind(expected_version.as_i64())
        .bind(status.as_str())
        .bind(retry_count as i32)
        .bind(error_message)
        .bind(next_retry_at)
        .bind(abandoned_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Conflict(id));
        }
        Ok(())
    }

    async fn cleanup_dispatched(&self, retention_period: Duration) -> Result<u64, RelayError> {
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::seconds_f64(retention_period.as_secs_f64());
        let result = sqlx::query(
            "DELETE FROM relay_outbox \
             WHERE status = 'Dispatched' AND dispatched_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get(
        &self,
        subject_key: &SubjectKey,
        content_hash: &ContentHash,
    ) -> Result<Option<IdempotencyRecord>, RelayError> {
        let row = sqlx::query(
            "SELECT processed_at, outcome FROM relay_idempotency \
             WHERE subject_key = $1 AND content_hash = $2",
        )
        .bind(subject_key.as_str())
        .bind(content_hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|row| {
            let outcome: String = row.try_get("outcome").map_err(storage_err)?;
            Ok(IdempotencyRecord {
                subject_key: subject_key.clone(),
                content_hash: content_hash.clone(),
                processed_at: row.try_get("processed_at").map_err(storage_err)?,
                outcome: ProcessedOutcome::parse(&outcome)?,
            })
        })
        .transpose()
    }

    async fn upsert(&self, record: IdempotencyRecord) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO relay_idempotency (subject_key, content_hash, processed_at, outcome) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (subject_key, content_hash) \
             DO UPDATE SET processed_at = EXCLUDED.processed_at, outcome = EXCLUDED.outcome",
        )
        .bind(record.subject_key.as_str())
        .bind(record.content_hash.as_str())
        .bind(record.processed_at)
        .bind(record.outcome.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}
