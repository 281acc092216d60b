use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::idempotency::{content_hash, IdempotencyGuard};
use crate::model::ProcessedOutcome;
use crate::object::{CorrelationId, EntryId, MessageType, Payload, SubjectKey};
use crate::storage::{IdempotencyStore, OutboxStore};
use std::sync::Arc;
use tracing::debug;

/// Producer-facing entry point to the delivery pipeline.
///
/// Fingerprints the payload, consults the idempotency guard, and records
/// the intent in the outbox only on a miss. Redelivered triggers for the
/// same subject and content are rejected inside the TTL window instead
/// of fanning out duplicate work.
pub struct RelayService<S, I> {
    outbox: Arc<S>,
    guard: IdempotencyGuard<I>,
}

impl<S, I> RelayService<S, I>
where
    S: OutboxStore + 'static,
    I: IdempotencyStore + 'static,
{
    pub fn new(outbox: Arc<S>, idempotency: Arc<I>, config: &RelayConfig) -> Self {
        Self {
            outbox,
            guard: IdempotencyGuard::new(idempotency, config.idempotency_ttl),
        }
    }

    /// Record the intent to deliver `payload` for `subject_key`.
    ///
    /// # Errors
    ///
    /// [`RelayError::DuplicateMessage`] if the same content was already
    /// processed for this subject inside the idempotency window;
    /// [`RelayError::Storage`] if either store is unreachable (not
    /// retried here; the caller decides).
    pub async fn submit(
        &self,
        message_type: MessageType,
        payload: Payload,
        correlation_id: CorrelationId,
        subject_key: SubjectKey,
    ) -> Result<EntryId, RelayError> {
        let hash = content_hash(&payload)?;

        if self.guard.has_been_processed(&subject_key, &hash).await? {
            debug!(
                subject_key = %subject_key,
                correlation_id = %correlation_id,
                "duplicate content suppressed"
            );
            return Err(RelayError::DuplicateMessage(subject_key));
        }

        let id = self
            .outbox
            .enqueue(message_type, payload, correlation_id)
            .await?;
        self.guard
            .mark_processed(subject_key, hash, ProcessedOutcome::Enqueued)
            .await?;
        Ok(id)
    }
}
