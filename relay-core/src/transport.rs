use crate::error::RelayError;
use crate::model::{DeadLetterRecord, QueueLease};
use crate::object::{MessageId, ReceiptToken};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Queue operations the delivery subsystem needs from a transport.
///
/// `receive` hands out time-bound leases; a lease's receipt token is the
/// only capability that can delete the message or move its visibility
/// deadline, and it stops working once the window closes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, body: String) -> Result<(), RelayError>;

    async fn receive(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueLease>, RelayError>;

    async fn delete(
        &self,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
    ) -> Result<(), RelayError>;

    /// Replace the message body and push its visibility deadline `delay`
    /// into the future; it reappears for lease once the delay elapses.
    async fn update_visibility(
        &self,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
        new_body: String,
        delay: Duration,
    ) -> Result<(), RelayError>;

    async fn ensure_exists(&self) -> Result<(), RelayError>;
}

/// The downstream consumer. One synchronous call, no partial success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, content: &str) -> Result<(), RelayError>;
}

/// Terminal destination for messages that will never be delivered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn bury(&self, record: DeadLetterRecord) -> Result<(), RelayError>;
}

/// Dead-letter sink that keeps only a structured log record. Suitable
/// where the operator's log pipeline is the system of record for
/// terminal failures.
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn bury(&self, record: DeadLetterRecord) -> Result<(), RelayError> {
        warn!(
            correlation_id = %record.message.correlation_id,
            subject_key = %record.message.subject_key,
            retry_count = record.message.retry_count,
            reason = %record.failure_reason,
            "message dead-lettered"
        );
        Ok(())
    }
}
