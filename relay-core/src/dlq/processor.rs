use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::{DeadLetterRecord, QueueLease, RetryableMessage};
use crate::retry::{RetryContext, RetryStrategy};
use crate::transport::DeliverySink;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exactly one of these per processed lease. The orchestrator maps each
/// to exactly one transport action: delete, update-visibility, or
/// dead-letter-then-delete.
#[derive(Debug, PartialEq)]
pub enum MessageProcessingResult {
    Success,
    Retry {
        new_body: String,
        delay: Duration,
    },
    DeadLetter {
        record: Box<DeadLetterRecord>,
    },
}

/// Decides the fate of one leased retry-queue message.
pub struct MessageProcessor<K> {
    strategy: RetryStrategy,
    sink: Arc<K>,
    config: Arc<RelayConfig>,
}

impl<K> MessageProcessor<K>
where
    K: DeliverySink + 'static,
{
    pub fn new(strategy: RetryStrategy, sink: Arc<K>, config: Arc<RelayConfig>) -> Self {
        Self {
            strategy,
            sink,
            config,
        }
    }

    /// Classify and act on one lease.
    ///
    /// Unknown failures map to the terminal outcome, never to retry:
    /// an unclassified error that kept cycling would reprocess forever.
    ///
    /// # Errors
    ///
    /// Only [`RelayError::Cancelled`]: a cancelled attempt yields no
    /// result at all, so it can never be mistaken for success.
    pub async fn process(
        &self,
        lease: &QueueLease,
        cancel: &CancellationToken,
    ) -> Result<MessageProcessingResult, RelayError> {
        let message = match RetryableMessage::from_wire(&lease.body) {
            Ok(message) => message,
            Err(e) => {
                // Malformed payloads will never parse on redelivery.
                return Ok(MessageProcessingResult::DeadLetter {
                    record: Box::new(DeadLetterRecord::from_raw_body(
                        &lease.body,
                        format!("deserialization failed: {e}"),
                    )),
                });
            }
        };

        let ctx = RetryContext::new(
            message.correlation_id.clone(),
            message.retry_count,
            self.config.max_retry_attempts,
        );
        if !self.strategy.should_retry(&ctx) {
            return Ok(MessageProcessingResult::DeadLetter {
                record: Box::new(DeadLetterRecord::new(message, "max retries exceeded")),
            });
        }

        let content = match serde_json::to_string(message.payload.as_json()) {
            Ok(content) => content,
            Err(e) => {
                return Ok(MessageProcessingResult::DeadLetter {
                    record: Box::new(DeadLetterRecord::new(
                        message,
                        format!("unclassified failure: {e}"),
                    )),
                });
            }
        };

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            res = self.sink.deliver(&content) => res,
        };

        match delivered {
            Ok(()) => Ok(MessageProcessingResult::Success),
            Err(e) => {
                let next = message.next_attempt();
                let next_ctx = RetryContext::new(
                    next.correlation_id.clone(),
                    next.retry_count,
                    self.config.max_retry_attempts,
                );
                let delay = self.strategy.next_delay(&next_ctx);
                debug!(
                    correlation_id = %next.correlation_id,
                    retry_count = next.retry_count,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "delivery failed, requeueing with backoff"
                );
                match next.to_wire() {
                    Ok(new_body) => Ok(MessageProcessingResult::Retry { new_body, delay }),
                    Err(ser) => Ok(MessageProcessingResult::DeadLetter {
                        record: Box::new(DeadLetterRecord::new(
                            message,
                            format!("unclassified failure: {ser}"),
                        )),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{CorrelationId, MessageId, Payload, ReceiptToken, SubjectKey};
    use crate::transport::MockDeliverySink;
    use serde_json::json;

    fn lease(body: String) -> QueueLease {
        QueueLease {
            message_id: MessageId::new("m-1"),
            receipt_token: ReceiptToken::new("r-1"),
            body,
            dequeue_count: 1,
        }
    }

    fn envelope(retry_count: u32) -> RetryableMessage {
        let mut message = RetryableMessage::new(
            Payload::new(json!({ "doc": "a-17" })),
            CorrelationId::new("corr-1"),
            SubjectKey::new("doc-a-17"),
        );
        message.retry_count = retry_count;
        message
    }

    fn processor(sink: MockDeliverySink) -> MessageProcessor<MockDeliverySink> {
        let config = Arc::new(RelayConfig {
            use_jitter: false,
            ..RelayConfig::default()
        });
        MessageProcessor::new(RetryStrategy::new(&config), Arc::new(sink), config)
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered_without_a_delivery_attempt() {
        let mut sink = MockDeliverySink::new();
        sink.expect_deliver().times(0);

        let result = processor(sink)
            .process(&lease("{definitely not an envelope".into()), &CancellationToken::new())
            .await
            .unwrap();

        match result {
            MessageProcessingResult::DeadLetter { record } => {
                assert!(record.failure_reason.contains("deserialization"));
            }
            other => panic!("expected DeadLetter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_budget_is_dead_lettered_without_a_delivery_attempt() {
        let mut sink = MockDeliverySink::new();
        sink.expect_deliver().times(0);

        let body = envelope(3).to_wire().unwrap();
        let result = processor(sink)
            .process(&lease(body), &CancellationToken::new())
            .await
            .unwrap();

        match result {
            MessageProcessingResult::DeadLetter { record } => {
                assert_eq!(record.failure_reason, "max retries exceeded");
                assert_eq!(record.message.retry_count, 3);
            }
            other => panic!("expected DeadLetter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_delivery_resolves_to_success() {
        let mut sink = MockDeliverySink::new();
        sink.expect_deliver()
            .withf(|content: &str| content.contains("a-17"))
            .times(1)
            .returning(|_| Ok(()));

        let body = envelope(0).to_wire().unwrap();
        let result = processor(sink)
            .process(&lease(body), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, MessageProcessingResult::Success);
    }

    #[tokio::test]
    async fn failed_delivery_requeues_with_the_next_attempts_backoff() {
        let mut sink = MockDeliverySink::new();
        sink.expect_deliver()
            .times(1)
            .returning(|_| Err(RelayError::Transport("sink 503".into())));

        let body = envelope(0).to_wire().unwrap();
        let result = processor(sink)
            .process(&lease(body), &CancellationToken::new())
            .await
            .unwrap();

        match result {
            MessageProcessingResult::Retry { new_body, delay } => {
                let requeued = RetryableMessage::from_wire(&new_body).unwrap();
                assert_eq!(requeued.retry_count, 1);
                // retry_count 1 with a two minute base: 2^2 minutes.
                assert_eq!(delay, Duration::from_secs(240));
            }
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_yields_no_result() {
        let mut sink = MockDeliverySink::new();
        sink.expect_deliver().returning(|_| {
            // Delivery would succeed, but cancellation must win first.
            Ok(())
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = envelope(0).to_wire().unwrap();
        let err = processor(sink)
            .process(&lease(body), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }
}
