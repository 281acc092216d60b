//! Reliable-delivery core: an outbox write-ahead store for outbound
//! messages, a poison-queue retry orchestrator with exponential backoff
//! and jitter, and a content-hash idempotency guard.
//!
//! Delivery is at-least-once; idempotent consumption at the sink is the
//! correctness backstop. Queue transport and the delivery sink stay
//! behind narrow traits so backends plug in without touching the core.

use crate::error::RelayError;
use crate::object::{CorrelationId, EntryId, MessageType, Payload};
use crate::storage::OutboxStore;

mod config;
mod dispatcher;
mod dlq;
mod error;
mod idempotency;
mod manager;
mod memory;
mod model;
mod object;
mod retry;
mod service;
mod storage;
mod transport;

/// Record the durable intent to deliver `payload`, bypassing the
/// idempotency guard. Producers that need duplicate suppression go
/// through [`service::RelayService`] instead.
pub async fn enqueue_message<S: OutboxStore>(
    store: &S,
    message_type: &str,
    payload: serde_json::Value,
    correlation_id: &str,
) -> Result<EntryId, RelayError> {
    store
        .enqueue(
            MessageType::new(message_type),
            Payload::new(payload),
            CorrelationId::new(correlation_id),
        )
        .await
}

pub mod prelude {
    pub use crate::storage::{IdempotencyStore, OutboxStore};
    pub use crate::transport::{
        DeadLetterSink, DeliverySink, MessageTransport, TracingDeadLetterSink,
    };

    pub use crate::dispatcher::{DispatchReport, OutboxDispatcher};
    pub use crate::dlq::{MessageProcessingResult, MessageProcessor, RetryOrchestrator, SweepReport};
    pub use crate::idempotency::{content_hash, IdempotencyGuard};
    pub use crate::manager::RelayManager;
    pub use crate::retry::{RetryContext, RetryStrategy};
    pub use crate::service::RelayService;

    pub use crate::config::{OutboxRetryPolicy, RelayConfig};
    pub use crate::model::{
        DeadLetterRecord, EntryStatus, IdempotencyRecord, OutboxEntry, ProcessedOutcome,
        QueueLease, RetryableMessage,
    };
    pub use crate::object::{
        ContentHash, CorrelationId, EntryId, MessageId, MessageType, Payload, ReceiptToken,
        SubjectKey, Version,
    };

    pub use crate::error::RelayError;

    pub use crate::memory::{
        InMemoryDeadLetterSink, InMemoryIdempotencyStore, InMemoryOutboxStore,
        InMemoryQueueTransport,
    };

    pub use crate::enqueue_message;
}
