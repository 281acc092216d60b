use crate::config::RelayConfig;
use crate::dispatcher::OutboxDispatcher;
use crate::dlq::{MessageProcessor, RetryOrchestrator};
use crate::error::RelayError;
use crate::retry::RetryStrategy;
use crate::storage::OutboxStore;
use crate::transport::{DeadLetterSink, DeliverySink, MessageTransport};
use std::sync::Arc;
use tokio::sync::watch::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Owns the two periodic sweeps: the outbox dispatcher pushing onto the
/// main queue, and the retry orchestrator draining the poison queue.
/// Each runs on its own interval, independently; a failed cycle is
/// logged and the next tick retries from durable state.
pub struct RelayManager<S, T, K, D> {
    queue: Arc<T>,
    retry_queue: Arc<T>,
    dispatcher: OutboxDispatcher<S, T>,
    orchestrator: RetryOrchestrator<T, K, D>,
    config: Arc<RelayConfig>,
    shutdown_rx: Receiver<bool>,
}

impl<S, T, K, D> RelayManager<S, T, K, D>
where
    S: OutboxStore + 'static,
    T: MessageTransport + 'static,
    K: DeliverySink + Send + Sync + 'static,
    D: DeadLetterSink + 'static,
{
    pub fn new(
        store: Arc<S>,
        queue: Arc<T>,
        retry_queue: Arc<T>,
        sink: Arc<K>,
        dead_letters: Arc<D>,
        config: Arc<RelayConfig>,
        shutdown_rx: Receiver<bool>,
    ) -> Self {
        let processor = Arc::new(MessageProcessor::new(
            RetryStrategy::new(&config),
            sink,
            config.clone(),
        ));
        Self {
            queue: queue.clone(),
            retry_queue: retry_queue.clone(),
            dispatcher: OutboxDispatcher::new(store, queue, config.clone()),
            orchestrator: RetryOrchestrator::new(
                retry_queue,
                processor,
                dead_letters,
                config.clone(),
            ),
            config,
            shutdown_rx,
        }
    }

    /// Run both sweep loops until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error only when setup fails outright (one of the
    /// queues cannot be ensured). Per-cycle failures stay inside the loop.
    pub async fn run(mut self) -> Result<(), RelayError> {
        self.queue.ensure_exists().await?;
        self.retry_queue.ensure_exists().await?;

        let cancel = CancellationToken::new();
        let mut dispatch_interval = tokio::time::interval(self.config.dispatch_interval);
        let mut retry_interval = tokio::time::interval(self.config.retry_poll_interval);

        info!("relay worker loop started");
        loop {
            tokio::select! {
                _ = dispatch_interval.tick() => {
                    match self.dispatcher.run_once(&cancel).await {
                        Ok(report) if report != Default::default() => {
                            debug!(
                                dispatched = report.dispatched,
                                failed = report.failed,
                                skipped = report.skipped,
                                cleaned = report.cleaned,
                                "dispatch sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dispatch sweep failed"),
                    }
                }
                _ = retry_interval.tick() => {
                    match self.orchestrator.run_once(&cancel).await {
                        Ok(report) if report.received > 0 => {
                            debug!(
                                received = report.received,
                                succeeded = report.succeeded,
                                retried = report.retried,
                                dead_lettered = report.dead_lettered,
                                "retry sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "retry sweep failed"),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
        info!("relay worker loop stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::OutboxEntry;
    use crate::object::{CorrelationId, MessageType, Payload};
    use crate::storage::MockOutboxStore;
    use crate::transport::{MockDeadLetterSink, MockDeliverySink, MockMessageTransport};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    #[tokio::test]
    async fn dispatches_pending_entries_then_stops_on_shutdown() {
        let config = Arc::new(RelayConfig {
            dispatch_interval: Duration::from_millis(10),
            retry_poll_interval: Duration::from_millis(10),
            ..RelayConfig::default()
        });

        let entry = OutboxEntry::new(
            MessageType::new("DocumentParsed"),
            Payload::new(json!({"doc": "a-17"})),
            CorrelationId::new("corr-1"),
        );
        let (entry_id, entry_version) = (entry.id, entry.version);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut store = MockOutboxStore::new();
        let batch = vec![entry];
        store
            .expect_list_pending()
            .times(1)
            .return_once(move |_| Ok(batch));
        store.expect_list_pending().returning(|_| Ok(Vec::new()));
        store
            .expect_mark_dispatched()
            .withf(move |id, version| *id == entry_id && *version == entry_version)
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_cleanup_dispatched().returning(|_| Ok(0));

        let mut queue = MockMessageTransport::new();
        queue.expect_ensure_exists().times(1).returning(|| Ok(()));
        queue.expect_send().times(1).returning(move |_| {
            let _ = shutdown_tx.send(true);
            Ok(())
        });

        let mut retry_queue = MockMessageTransport::new();
        retry_queue
            .expect_ensure_exists()
            .times(1)
            .returning(|| Ok(()));
        retry_queue.expect_receive().returning(|_, _| Ok(Vec::new()));

        let manager = RelayManager::new(
            Arc::new(store),
            Arc::new(queue),
            Arc::new(retry_queue),
            Arc::new(MockDeliverySink::new()),
            Arc::new(MockDeadLetterSink::new()),
            config,
            shutdown_rx,
        );

        let handle = tokio::spawn(async move {
            manager.run().await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("manager did not stop in time")
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_queue_at_startup_is_fatal() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = MockOutboxStore::new();
        let mut queue = MockMessageTransport::new();
        queue
            .expect_ensure_exists()
            .returning(|| Err(RelayError::Transport("queue service unreachable".into())));

        let manager = RelayManager::new(
            Arc::new(store),
            Arc::new(queue),
            Arc::new(MockMessageTransport::new()),
            Arc::new(MockDeliverySink::new()),
            Arc::new(MockDeadLetterSink::new()),
            Arc::new(RelayConfig::default()),
            shutdown_rx,
        );

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
