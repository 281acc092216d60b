use crate::object::{EntryId, SubjectKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The outbox or idempotency store cannot be reached. Fatal for the
    /// current sweep; the next scheduled sweep retries from durable state.
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Transient failure talking to the queue or the delivery sink.
    #[error("transport error: {0}")]
    Transport(String),

    /// A queue body that cannot be deserialized. Terminal: redelivery
    /// will never make a malformed payload parse.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("outbox entry {0} not found")]
    NotFound(EntryId),

    /// The entry was concurrently modified; the caller holds a stale
    /// version and must re-read before deciding to retry.
    #[error("outbox entry {0} was concurrently modified")]
    Conflict(EntryId),

    /// The same content for this subject was already processed inside the
    /// idempotency window.
    #[error("duplicate message for subject {0}")]
    DuplicateMessage(SubjectKey),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sweep's caller asked for cancellation while an attempt was in
    /// flight. Never mapped to a delivery outcome.
    #[error("sweep cancelled")]
    Cancelled,
}

impl RelayError {
    /// Transient errors are the ones worth re-attempting through backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Storage(_) | RelayError::Transport(_))
    }
}
