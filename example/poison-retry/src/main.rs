//! Walkthrough of the poison-queue path: a sink that keeps failing, a
//! message that backs off through its retry budget, and the dead-letter
//! record it ends as.

use relay_core::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Fails the first `failures` deliveries, then succeeds.
struct FlakySink {
    failures: u32,
    attempts: AtomicU32,
}

#[async_trait::async_trait]
impl DeliverySink for FlakySink {
    async fn deliver(&self, content: &str) -> Result<(), RelayError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            info!(attempt, content, "sink rejects the delivery");
            Err(RelayError::Transport("sink 503".into()))
        } else {
            info!(attempt, content, "sink accepts the delivery");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let config = Arc::new(RelayConfig {
        max_retry_attempts: 2,
        // A sub-minute base keeps the demo short: every delay lands on
        // the one second floor.
        base_retry_delay: Duration::from_millis(600),
        use_jitter: false,
        ..RelayConfig::default()
    });

    let transport = Arc::new(InMemoryQueueTransport::new());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
    let sink = Arc::new(FlakySink {
        failures: u32::MAX,
        attempts: AtomicU32::new(0),
    });

    let processor = Arc::new(MessageProcessor::new(
        RetryStrategy::new(&config),
        sink,
        config.clone(),
    ));
    let orchestrator = RetryOrchestrator::new(
        transport.clone(),
        processor,
        dead_letters.clone(),
        config.clone(),
    );

    let envelope = RetryableMessage::new(
        Payload::new(serde_json::json!({"doc": "a-17", "pages": 3})),
        CorrelationId::new("corr-1"),
        SubjectKey::new("doc-a-17"),
    );
    transport.send(envelope.to_wire()?).await?;
    info!("poisoned message placed on the retry queue");

    let cancel = CancellationToken::new();
    loop {
        let report = orchestrator.run_once(&cancel).await?;
        if report.received > 0 {
            info!(
                received = report.received,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "sweep finished"
            );
        }
        if report.dead_lettered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    for record in dead_letters.records() {
        info!(
            correlation_id = %record.message.correlation_id,
            retry_count = record.message.retry_count,
            reason = %record.failure_reason,
            "dead-letter record"
        );
    }
    Ok(())
}
