use crate::error::RelayError;
use crate::model::{IdempotencyRecord, OutboxEntry};
use crate::object::{ContentHash, CorrelationId, EntryId, MessageType, Payload, SubjectKey, Version};
use async_trait::async_trait;
use std::time::Duration;

/// Write-ahead log of outbound messages.
///
/// Entries move `Pending -> Dispatched` on success, cycle through
/// `Failed` with a backoff gate while the retry budget lasts, and end in
/// `Abandoned` once it is exhausted. The table is shared across
/// dispatcher instances, so every mutation is a compare-and-swap on the
/// entry's version: a lost race surfaces as [`RelayError::Conflict`],
/// never as a silent overwrite.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Create a Pending entry. Not retried internally on
    /// [`RelayError::Storage`]; callers decide.
    async fn enqueue(
        &self,
        message_type: MessageType,
        payload: Payload,
        correlation_id: CorrelationId,
    ) -> Result<EntryId, RelayError>;

    /// Entries awaiting dispatch (Pending, plus Failed ones still inside
    /// their backoff window), in insertion order with id as tiebreak.
    async fn list_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>, RelayError>;

    /// Transition Pending/Failed -> Dispatched, stamping `dispatched_at`.
    async fn mark_dispatched(&self, id: EntryId, expected_version: Version)
        -> Result<(), RelayError>;

    /// Record a failed dispatch attempt: bump `retry_count`, compute the
    /// next backoff deadline, and abandon the entry once the budget is
    /// exhausted.
    async fn mark_failed(
        &self,
        id: EntryId,
        expected_version: Version,
        error_message: &str,
    ) -> Result<(), RelayError>;

    /// Delete Dispatched entries older than the retention period. Safe to
    /// run concurrently with enqueue and dispatch; only a terminal status
    /// is touched. Returns the number removed.
    async fn cleanup_dispatched(&self, retention_period: Duration) -> Result<u64, RelayError>;
}

/// Persistent (subject, content-hash) -> processed-marker map.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(
        &self,
        subject_key: &SubjectKey,
        content_hash: &ContentHash,
    ) -> Result<Option<IdempotencyRecord>, RelayError>;

    /// Insert or overwrite the record for its key. A second upsert for
    /// the same key resets the TTL window.
    async fn upsert(&self, record: IdempotencyRecord) -> Result<(), RelayError>;
}
