use crate::error::RelayError;
use crate::object::{
    CorrelationId, EntryId, MessageId, MessageType, Payload, ReceiptToken, SubjectKey, Version,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle of a durable outbox entry.
///
/// `Pending -> Dispatched` is the terminal success path. `Pending ->
/// Failed` cycles back to dispatch-eligible once `next_retry_at` has
/// passed, until the retry budget is exhausted and the entry becomes
/// `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Pending,
    Dispatched,
    Failed,
    Abandoned,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "Pending",
            EntryStatus::Dispatched => "Dispatched",
            EntryStatus::Failed => "Failed",
            EntryStatus::Abandoned => "Abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RelayError> {
        match s {
            "Pending" => Ok(EntryStatus::Pending),
            "Dispatched" => Ok(EntryStatus::Dispatched),
            "Failed" => Ok(EntryStatus::Failed),
            "Abandoned" => Ok(EntryStatus::Abandoned),
            other => Err(RelayError::Storage(format!(
                "unknown outbox status '{other}'"
            ))),
        }
    }
}

/// Durable intent to deliver one message. Owned exclusively by the outbox
/// store; mutated only through its update operations under a version check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: EntryId,
    pub message_type: MessageType,
    pub payload: Payload,
    pub status: EntryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatched_at: Option<OffsetDateTime>,
    pub retry_count: u32,
    pub correlation_id: CorrelationId,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub abandoned_at: Option<OffsetDateTime>,
    pub version: Version,
}

impl OutboxEntry {
    pub fn new(message_type: MessageType, payload: Payload, correlation_id: CorrelationId) -> Self {
        Self {
            id: EntryId::default(),
            message_type,
            payload,
            status: EntryStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            dispatched_at: None,
            retry_count: 0,
            correlation_id,
            last_error: None,
            next_retry_at: None,
            abandoned_at: None,
            version: Version::initial(),
        }
    }

    /// A failed entry is not dispatch-eligible again until its backoff
    /// deadline has passed.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        match (self.status, self.next_retry_at) {
            (EntryStatus::Failed, Some(at)) => now >= at,
            (EntryStatus::Pending, _) => true,
            _ => false,
        }
    }
}

/// Wire envelope for a message in flight on the retry queue. Embeds the
/// retry count so visibility-timeout redelivery carries retry state
/// forward without a store lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryableMessage {
    pub payload: Payload,
    pub correlation_id: CorrelationId,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub subject_key: SubjectKey,
}

impl RetryableMessage {
    pub fn new(payload: Payload, correlation_id: CorrelationId, subject_key: SubjectKey) -> Self {
        Self {
            payload,
            correlation_id,
            retry_count: 0,
            created_at: OffsetDateTime::now_utc(),
            subject_key,
        }
    }

    /// The envelope for the next requeue: identical except `retry_count`
    /// grows by exactly one.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    pub fn to_wire(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(body: &str) -> Result<Self, RelayError> {
        serde_json::from_str(body).map_err(|e| RelayError::MalformedMessage(e.to_string()))
    }
}

/// Terminal record for a message that exhausted its retries or is
/// permanently invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub message: RetryableMessage,
    pub failure_reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_attempt_at: OffsetDateTime,
}

impl DeadLetterRecord {
    pub fn new(message: RetryableMessage, failure_reason: impl Into<String>) -> Self {
        Self {
            message,
            failure_reason: failure_reason.into(),
            last_attempt_at: OffsetDateTime::now_utc(),
        }
    }

    /// Record for a body that never parsed into an envelope. The raw text
    /// is preserved as the payload so nothing is lost on the way out.
    pub fn from_raw_body(body: &str, failure_reason: impl Into<String>) -> Self {
        let message = RetryableMessage::new(
            Payload::new(serde_json::json!({ "raw_body": body })),
            CorrelationId::new("unknown"),
            SubjectKey::new("unknown"),
        );
        Self::new(message, failure_reason)
    }
}

/// A leased, currently-invisible queued message. Borrowed capability: the
/// receipt token stops working once the visibility window closes or the
/// lease is released.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueLease {
    pub message_id: MessageId,
    pub receipt_token: ReceiptToken,
    pub body: String,
    pub dequeue_count: u32,
}

/// How a subject's content was handled, recorded next to the idempotency
/// fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessedOutcome {
    Enqueued,
    Delivered,
    DeadLettered,
}

impl ProcessedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedOutcome::Enqueued => "Enqueued",
            ProcessedOutcome::Delivered => "Delivered",
            ProcessedOutcome::DeadLettered => "DeadLettered",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RelayError> {
        match s {
            "Enqueued" => Ok(ProcessedOutcome::Enqueued),
            "Delivered" => Ok(ProcessedOutcome::Delivered),
            "DeadLettered" => Ok(ProcessedOutcome::DeadLettered),
            other => Err(RelayError::Storage(format!(
                "unknown processed outcome '{other}'"
            ))),
        }
    }
}

/// Processed marker for one (subject, content) fingerprint. Expiry is
/// soft: a record older than the TTL reads as absent, it is not purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub subject_key: SubjectKey,
    pub content_hash: crate::object::ContentHash,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
    pub outcome: ProcessedOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_envelope_carries_retry_count_forward() {
        let msg = RetryableMessage::new(
            Payload::new(json!({"doc": "a-17"})),
            CorrelationId::new("corr-1"),
            SubjectKey::new("doc-a-17"),
        );
        let requeued = msg.next_attempt().next_attempt();
        let body = requeued.to_wire().unwrap();
        let back = RetryableMessage::from_wire(&body).unwrap();
        assert_eq!(back.retry_count, 2);
        assert_eq!(back.correlation_id, msg.correlation_id);
        assert_eq!(back.payload, msg.payload);
    }

    #[test]
    fn from_wire_classifies_garbage_as_malformed() {
        let err = RetryableMessage::from_wire("{not json").unwrap_err();
        assert!(matches!(err, RelayError::MalformedMessage(_)));
    }

    #[test]
    fn failed_entry_is_due_only_after_backoff_deadline() {
        let mut entry = OutboxEntry::new(
            MessageType::new("DocumentParsed"),
            Payload::new(json!({"id": 1})),
            CorrelationId::new("c"),
        );
        let now = OffsetDateTime::now_utc();
        assert!(entry.is_due(now));

        entry.status = EntryStatus::Failed;
        entry.next_retry_at = Some(now + time::Duration::minutes(2));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + time::Duration::minutes(3)));

        entry.status = EntryStatus::Abandoned;
        assert!(!entry.is_due(now + time::Duration::minutes(3)));
    }
}
