//! End-to-end flows over the in-memory backends: outbox dispatch with
//! duplicate suppression, and the poison-queue path from failed delivery
//! through backoff to the dead-letter sink.

use relay_core::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config() -> Arc<RelayConfig> {
    Arc::new(RelayConfig {
        use_jitter: false,
        max_messages_per_batch: 10,
        dispatch_retry: OutboxRetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            doubling_factor: 2,
        },
        ..RelayConfig::default()
    })
}

struct FlakySink {
    failures_left: std::sync::Mutex<u32>,
}

#[async_trait::async_trait]
impl DeliverySink for FlakySink {
    async fn deliver(&self, _content: &str) -> Result<(), RelayError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            Err(RelayError::Transport("sink 503".into()))
        } else {
            Ok(())
        }
    }
}

fn orchestrator(
    transport: Arc<InMemoryQueueTransport>,
    dead_letters: Arc<InMemoryDeadLetterSink>,
    sink_failures: u32,
    config: Arc<RelayConfig>,
) -> RetryOrchestrator<InMemoryQueueTransport, FlakySink, InMemoryDeadLetterSink> {
    let sink = Arc::new(FlakySink {
        failures_left: std::sync::Mutex::new(sink_failures),
    });
    let processor = Arc::new(MessageProcessor::new(
        RetryStrategy::new(&config),
        sink,
        config.clone(),
    ));
    RetryOrchestrator::new(transport, processor, dead_letters, config)
}

#[tokio::test]
async fn submitted_document_reaches_the_queue_exactly_once() {
    let config = test_config();
    let store = Arc::new(InMemoryOutboxStore::new(config.dispatch_retry.clone()));
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let transport = Arc::new(InMemoryQueueTransport::new());

    let service = RelayService::new(store.clone(), idempotency, &config);
    let entry_id = service
        .submit(
            MessageType::new("DocumentParsed"),
            Payload::new(json!({"doc": "a-17", "pages": 3})),
            CorrelationId::new("corr-1"),
            SubjectKey::new("doc-a-17"),
        )
        .await
        .unwrap();

    // A redelivered trigger for the same content is suppressed.
    let err = service
        .submit(
            MessageType::new("DocumentParsed"),
            Payload::new(json!({"doc": "a-17", "pages": 3})),
            CorrelationId::new("corr-2"),
            SubjectKey::new("doc-a-17"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::DuplicateMessage(_)));

    let dispatcher = OutboxDispatcher::new(store.clone(), transport.clone(), config);
    let report = dispatcher
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(transport.queued_len(), 1);

    let entry = store.entry(entry_id).unwrap();
    assert_eq!(entry.status, EntryStatus::Dispatched);
    assert!(entry.dispatched_at.is_some());
}

#[tokio::test]
async fn failed_dispatch_retries_after_backoff_and_then_succeeds() {
    let config = test_config();
    let store = Arc::new(InMemoryOutboxStore::new(config.dispatch_retry.clone()));
    let transport = Arc::new(InMemoryQueueTransport::new());

    let id = enqueue_message(
        store.as_ref(),
        "DocumentParsed",
        json!({"doc": "a-17"}),
        "corr-1",
    )
    .await
    .unwrap();

    // Sabotage the first sweep by marking the entry failed under it.
    let version = store.entry(id).unwrap().version;
    store.mark_failed(id, version, "queue down").await.unwrap();
    assert_eq!(store.entry(id).unwrap().status, EntryStatus::Failed);

    let dispatcher = OutboxDispatcher::new(store.clone(), transport.clone(), config);

    // Inside the backoff window the entry is skipped.
    let report = dispatcher
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.skipped, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = dispatcher
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(store.entry(id).unwrap().status, EntryStatus::Dispatched);
}

#[tokio::test]
async fn delivered_retry_message_leaves_the_queue() {
    let config = test_config();
    let transport = Arc::new(InMemoryQueueTransport::new());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

    let envelope = RetryableMessage::new(
        Payload::new(json!({"doc": "a-17"})),
        CorrelationId::new("corr-1"),
        SubjectKey::new("doc-a-17"),
    );
    transport.send(envelope.to_wire().unwrap()).await.unwrap();

    let report = orchestrator(transport.clone(), dead_letters.clone(), 0, config)
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.queued_len(), 0);
    assert!(dead_letters.records().is_empty());
}

#[tokio::test]
async fn failing_delivery_backs_off_then_dead_letters() {
    let config = Arc::new(RelayConfig {
        max_retry_attempts: 1,
        // Sub-minute base so the backoff floor of one second applies.
        base_retry_delay: Duration::from_millis(600),
        ..test_config().as_ref().clone()
    });
    let transport = Arc::new(InMemoryQueueTransport::new());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
    let orchestrator = orchestrator(transport.clone(), dead_letters.clone(), u32::MAX, config);

    let envelope = RetryableMessage::new(
        Payload::new(json!({"doc": "a-17"})),
        CorrelationId::new("corr-1"),
        SubjectKey::new("doc-a-17"),
    );
    transport.send(envelope.to_wire().unwrap()).await.unwrap();

    // First sweep: delivery fails, the message is requeued invisible
    // with its retry count bumped.
    let report = orchestrator
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(transport.queued_len(), 1);

    // Immediately after, the message is still invisible.
    let report = orchestrator
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.received, 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Second attempt: the budget of one is spent, so the message is
    // dead-lettered without another delivery attempt.
    let report = orchestrator
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(transport.queued_len(), 0);

    let records = dead_letters.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_reason, "max retries exceeded");
    assert_eq!(records[0].message.retry_count, 1);
}

#[tokio::test]
async fn malformed_queue_body_goes_straight_to_the_dead_letter_sink() {
    let config = test_config();
    let transport = Arc::new(InMemoryQueueTransport::new());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

    transport.send("{not an envelope".into()).await.unwrap();

    let report = orchestrator(transport.clone(), dead_letters.clone(), 0, config)
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(transport.queued_len(), 0);
    let records = dead_letters.records();
    assert!(records[0].failure_reason.contains("deserialization"));
}
