//! End-to-end demo on the in-memory backends: submit two documents (one
//! a duplicate), watch the dispatcher move them to the queue, and let
//! the manager loops run until shutdown.

use relay_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};

struct LoggingSink;

#[async_trait::async_trait]
impl DeliverySink for LoggingSink {
    async fn deliver(&self, content: &str) -> Result<(), RelayError> {
        info!(content, "delivered to sink");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let config = Arc::new(RelayConfig {
        dispatch_interval: Duration::from_secs(1),
        retry_poll_interval: Duration::from_secs(1),
        ..RelayConfig::default()
    });

    let store = Arc::new(InMemoryOutboxStore::new(config.dispatch_retry.clone()));
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let queue = Arc::new(InMemoryQueueTransport::new());
    let retry_queue = Arc::new(InMemoryQueueTransport::new());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let manager = RelayManager::new(
        store.clone(),
        queue.clone(),
        retry_queue,
        Arc::new(LoggingSink),
        dead_letters,
        config.clone(),
        shutdown_rx,
    );
    let worker = tokio::spawn(async move {
        if let Err(e) = manager.run().await {
            error!(error = %e, "relay worker failed");
        }
    });

    let service = RelayService::new(store, idempotency, &config);

    info!("submitting a parsed document");
    let entry_id = service
        .submit(
            MessageType::new("DocumentParsed"),
            Payload::new(serde_json::json!({"doc": "a-17", "pages": 3})),
            CorrelationId::new("corr-1"),
            SubjectKey::new("doc-a-17"),
        )
        .await?;
    info!(%entry_id, "outbox entry recorded");

    info!("submitting the same content again (a redelivered trigger)");
    match service
        .submit(
            MessageType::new("DocumentParsed"),
            Payload::new(serde_json::json!({"doc": "a-17", "pages": 3})),
            CorrelationId::new("corr-2"),
            SubjectKey::new("doc-a-17"),
        )
        .await
    {
        Err(RelayError::DuplicateMessage(subject)) => {
            info!(%subject, "duplicate suppressed by the idempotency guard");
        }
        other => info!(?other, "unexpected outcome"),
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    info!(
        queued = queue.queued_len(),
        "queue state after the dispatch sweep"
    );

    let _ = shutdown_tx.send(true);
    worker.await?;
    Ok(())
}
