mod processor;

pub use processor::{MessageProcessingResult, MessageProcessor};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::{DeadLetterRecord, QueueLease};
use crate::transport::{DeadLetterSink, DeliverySink, MessageTransport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What one poison-queue sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub received: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Leases left untouched by cancellation; they reappear once their
    /// visibility window closes.
    pub abandoned_leases: usize,
}

/// Periodic sweep over the retry/poison queue.
///
/// Each cycle leases a bounded batch, fans the leases out to concurrent
/// processor tasks, waits for all of them, and resolves every result to
/// exactly one transport action. One message's outcome never blocks or
/// fails another.
pub struct RetryOrchestrator<T, K, D> {
    transport: Arc<T>,
    processor: Arc<MessageProcessor<K>>,
    dead_letters: Arc<D>,
    config: Arc<RelayConfig>,
}

impl<T, K, D> RetryOrchestrator<T, K, D>
where
    T: MessageTransport + 'static,
    K: DeliverySink + Send + Sync + 'static,
    D: DeadLetterSink + 'static,
{
    pub fn new(
        transport: Arc<T>,
        processor: Arc<MessageProcessor<K>>,
        dead_letters: Arc<D>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            transport,
            processor,
            dead_letters,
            config,
        }
    }

    /// Run a single sweep.
    ///
    /// # Errors
    ///
    /// Only the initial `receive` can fail the cycle; per-lease failures
    /// are resolved into retry or dead-letter state.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SweepReport, RelayError> {
        let leases = self
            .transport
            .receive(
                self.config.max_messages_per_batch,
                self.config.processing_visibility_timeout,
            )
            .await?;

        let mut report = SweepReport {
            received: leases.len(),
            ..SweepReport::default()
        };
        if leases.is_empty() {
            return Ok(report);
        }

        // Fan out, bounded by the batch size the receive call already
        // enforced. Leases are cloned so a panicked task cannot take its
        // lease down with it.
        let mut handles = Vec::with_capacity(leases.len());
        for lease in &leases {
            let processor = self.processor.clone();
            let lease = lease.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                processor.process(&lease, &cancel).await
            }));
        }

        for (lease, handle) in leases.into_iter().zip(handles) {
            match handle.await {
                Ok(Ok(result)) => self.resolve(lease, result, &mut report).await,
                Ok(Err(RelayError::Cancelled)) => {
                    debug!(
                        message_id = %lease.message_id,
                        "attempt cancelled, lease left to reappear"
                    );
                    report.abandoned_leases += 1;
                }
                Ok(Err(e)) => {
                    // No classified outcome: the conservative terminal one.
                    let record =
                        DeadLetterRecord::from_raw_body(&lease.body, format!("unclassified failure: {e}"));
                    self.resolve(
                        lease,
                        MessageProcessingResult::DeadLetter {
                            record: Box::new(record),
                        },
                        &mut report,
                    )
                    .await;
                }
                Err(join_err) => {
                    error!(
                        message_id = %lease.message_id,
                        error = %join_err,
                        "processor task died"
                    );
                    let record = DeadLetterRecord::from_raw_body(
                        &lease.body,
                        format!("processor task died: {join_err}"),
                    );
                    self.resolve(
                        lease,
                        MessageProcessingResult::DeadLetter {
                            record: Box::new(record),
                        },
                        &mut report,
                    )
                    .await;
                }
            }
        }

        Ok(report)
    }

    /// Map one result to its transport action. Action failures are logged
    /// and absorbed: the untouched lease reappears after its visibility
    /// window, which at-least-once semantics already account for.
    async fn resolve(&self, lease: QueueLease, result: MessageProcessingResult, report: &mut SweepReport) {
        match result {
            MessageProcessingResult::Success => {
                match self
                    .transport
                    .delete(&lease.message_id, &lease.receipt_token)
                    .await
                {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        warn!(
                            message_id = %lease.message_id,
                            error = %e,
                            "failed to delete delivered message, it will redeliver"
                        );
                        report.succeeded += 1;
                    }
                }
            }
            MessageProcessingResult::Retry { new_body, delay } => {
                match self
                    .transport
                    .update_visibility(&lease.message_id, &lease.receipt_token, new_body, delay)
                    .await
                {
                    Ok(()) => report.retried += 1,
                    Err(e) => {
                        warn!(
                            message_id = %lease.message_id,
                            error = %e,
                            "failed to requeue message, lease will reappear without backoff"
                        );
                        report.abandoned_leases += 1;
                    }
                }
            }
            MessageProcessingResult::DeadLetter { record } => {
                match self.dead_letters.bury(*record).await {
                    Ok(()) => {
                        if let Err(e) = self
                            .transport
                            .delete(&lease.message_id, &lease.receipt_token)
                            .await
                        {
                            warn!(
                                message_id = %lease.message_id,
                                error = %e,
                                "failed to delete dead-lettered message"
                            );
                        }
                        report.dead_lettered += 1;
                    }
                    Err(e) => {
                        // Keep the lease: losing the record would be a
                        // silent drop, redelivery is the safer failure.
                        error!(
                            message_id = %lease.message_id,
                            error = %e,
                            "failed to record dead letter, leaving message on the queue"
                        );
                        report.abandoned_leases += 1;
                    }
                }
            }
        }
    }
}
