use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::OutboxEntry;
use crate::storage::OutboxStore;
use crate::transport::MessageTransport;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What one dispatch sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cleaned: u64,
}

enum EntryOutcome {
    Dispatched,
    Failed,
    Skipped,
}

/// Periodic sweep that moves due outbox entries onto the transport.
///
/// Entries in a batch are sent concurrently and the sweep waits for all
/// of them. One entry's failure never aborts the batch; it is recorded
/// in outbox state and the sweep moves on. Only setup-class failures
/// (the store itself unreachable) are raised to the caller.
pub struct OutboxDispatcher<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    config: Arc<RelayConfig>,
}

impl<S, T> OutboxDispatcher<S, T>
where
    S: OutboxStore + 'static,
    T: MessageTransport + 'static,
{
    pub fn new(store: Arc<S>, transport: Arc<T>, config: Arc<RelayConfig>) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Run a single sweep: fetch a bounded batch, fan the due entries out
    /// to concurrent send tasks, fan in, then clean up dispatched entries
    /// past the retention window.
    ///
    /// # Errors
    ///
    /// Only [`RelayError::Storage`] from the fetch or cleanup is
    /// propagated; per-entry transport failures become `Failed` entries.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<DispatchReport, RelayError> {
        let entries = self
            .store
            .list_pending(self.config.max_messages_per_batch)
            .await?;

        let mut report = DispatchReport::default();
        if cancel.is_cancelled() {
            warn!("dispatch sweep cancelled, leaving entries for the next sweep");
            return Ok(report);
        }

        let now = OffsetDateTime::now_utc();
        let mut handles = Vec::new();
        for entry in entries {
            if !entry.is_due(now) {
                report.skipped += 1;
                continue;
            }
            let store = self.store.clone();
            let transport = self.transport.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                Self::dispatch_entry(store, transport, entry, cancel).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(EntryOutcome::Dispatched) => report.dispatched += 1,
                Ok(EntryOutcome::Failed) => report.failed += 1,
                Ok(EntryOutcome::Skipped) => report.skipped += 1,
                Err(join_err) => {
                    // The entry was never marked either way; the next
                    // sweep picks it up again.
                    error!(error = %join_err, "dispatch task died");
                    report.skipped += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(report);
        }
        report.cleaned = self
            .store
            .cleanup_dispatched(self.config.cleanup_retention_period)
            .await?;

        Ok(report)
    }

    async fn dispatch_entry(
        store: Arc<S>,
        transport: Arc<T>,
        entry: OutboxEntry,
        cancel: CancellationToken,
    ) -> EntryOutcome {
        let body = match serde_json::to_string(entry.payload.as_json()) {
            Ok(body) => body,
            Err(e) => {
                // An unserializable payload will not improve with time.
                return Self::fail_entry(&store, &entry, &format!("payload serialization failed: {e}"))
                    .await;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The attempt never started; leaving the entry untouched
                // keeps at-least-once.
                warn!(
                    entry_id = %entry.id,
                    correlation_id = %entry.correlation_id,
                    "dispatch cancelled, entry left for the next sweep"
                );
                return EntryOutcome::Skipped;
            }
            res = transport.send(body) => res,
        };

        match sent {
            Ok(()) => match store.mark_dispatched(entry.id, entry.version).await {
                Ok(()) => EntryOutcome::Dispatched,
                Err(RelayError::Conflict(id)) => {
                    // Another dispatcher instance got there first.
                    debug!(entry_id = %id, "lost dispatch race, entry already updated");
                    EntryOutcome::Skipped
                }
                Err(e) => {
                    error!(
                        entry_id = %entry.id,
                        correlation_id = %entry.correlation_id,
                        error = %e,
                        "failed to mark entry dispatched"
                    );
                    EntryOutcome::Failed
                }
            },
            Err(e) => {
                debug!(
                    entry_id = %entry.id,
                    correlation_id = %entry.correlation_id,
                    error = %e,
                    "transport send failed"
                );
                Self::fail_entry(&store, &entry, &e.to_string()).await
            }
        }
    }

    async fn fail_entry(store: &Arc<S>, entry: &OutboxEntry, message: &str) -> EntryOutcome {
        match store.mark_failed(entry.id, entry.version, message).await {
            Ok(()) => EntryOutcome::Failed,
            Err(RelayError::Conflict(id)) => {
                debug!(entry_id = %id, "lost mark-failed race, entry already updated");
                EntryOutcome::Skipped
            }
            Err(e) => {
                error!(
                    entry_id = %entry.id,
                    correlation_id = %entry.correlation_id,
                    error = %e,
                    "failed to record dispatch failure"
                );
                EntryOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryStatus;
    use crate::object::{CorrelationId, MessageType, Payload};
    use crate::storage::MockOutboxStore;
    use crate::transport::MockMessageTransport;
    use mockall::predicate::eq;
    use serde_json::json;
    use time::Duration as TimeDuration;

    fn entry(tag: &str) -> OutboxEntry {
        OutboxEntry::new(
            MessageType::new("DocumentParsed"),
            Payload::new(json!({ "tag": tag })),
            CorrelationId::new(format!("corr-{tag}")),
        )
    }

    fn dispatcher(
        store: MockOutboxStore,
        transport: MockMessageTransport,
    ) -> OutboxDispatcher<MockOutboxStore, MockMessageTransport> {
        OutboxDispatcher::new(
            Arc::new(store),
            Arc::new(transport),
            Arc::new(RelayConfig::default()),
        )
    }

    #[tokio::test]
    async fn sweeps_pending_entries_onto_the_transport() {
        let a = entry("a");
        let b = entry("b");
        let (id_a, v_a) = (a.id, a.version);
        let (id_b, v_b) = (b.id, b.version);

        let mut store = MockOutboxStore::new();
        let entries = vec![a, b];
        store
            .expect_list_pending()
            .with(eq(10))
            .times(1)
            .return_once(move |_| Ok(entries));
        store
            .expect_mark_dispatched()
            .with(eq(id_a), eq(v_a))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_mark_dispatched()
            .with(eq(id_b), eq(v_b))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_cleanup_dispatched()
            .times(1)
            .returning(|_| Ok(3));

        let mut transport = MockMessageTransport::new();
        transport.expect_send().times(2).returning(|_| Ok(()));

        let report = dispatcher(store, transport)
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report,
            DispatchReport {
                dispatched: 2,
                cleaned: 3,
                ..DispatchReport::default()
            }
        );
    }

    #[tokio::test]
    async fn one_failing_entry_does_not_abort_the_batch() {
        let a = entry("flaky");
        let b = entry("healthy");
        let id_a = a.id;
        let id_b = b.id;

        let mut store = MockOutboxStore::new();
        let entries = vec![a, b];
        store
            .expect_list_pending()
            .return_once(move |_| Ok(entries));
        store
            .expect_mark_failed()
            .withf(move |id, _, msg| *id == id_a && msg.contains("queue down"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_mark_dispatched()
            .withf(move |id, _| *id == id_b)
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_cleanup_dispatched().returning(|_| Ok(0));

        let mut transport = MockMessageTransport::new();
        transport.expect_send().times(2).returning(|body| {
            if body.contains("flaky") {
                Err(RelayError::Transport("queue down".into()))
            } else {
                Ok(())
            }
        });

        let report = dispatcher(store, transport)
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn failed_entries_inside_their_backoff_window_are_skipped() {
        let mut not_due = entry("later");
        not_due.status = EntryStatus::Failed;
        not_due.retry_count = 1;
        not_due.next_retry_at = Some(OffsetDateTime::now_utc() + TimeDuration::minutes(5));

        let mut store = MockOutboxStore::new();
        let entries = vec![not_due];
        store
            .expect_list_pending()
            .return_once(move |_| Ok(entries));
        store.expect_cleanup_dispatched().returning(|_| Ok(0));

        let transport = MockMessageTransport::new();

        let report = dispatcher(store, transport)
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn losing_the_dispatch_race_is_not_a_failure() {
        let a = entry("a");
        let id_a = a.id;

        let mut store = MockOutboxStore::new();
        let entries = vec![a];
        store
            .expect_list_pending()
            .return_once(move |_| Ok(entries));
        store
            .expect_mark_dispatched()
            .returning(move |_, _| Err(RelayError::Conflict(id_a)));
        store.expect_cleanup_dispatched().returning(|_| Ok(0));

        let mut transport = MockMessageTransport::new();
        transport.expect_send().returning(|_| Ok(()));

        let report = dispatcher(store, transport)
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn storage_failure_on_fetch_is_raised_to_the_caller() {
        let mut store = MockOutboxStore::new();
        store
            .expect_list_pending()
            .returning(|_| Err(RelayError::Storage("connection refused".into())));

        let transport = MockMessageTransport::new();

        let err = dispatcher(store, transport)
            .run_once(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)));
    }

    #[tokio::test]
    async fn cancelled_sweep_marks_nothing() {
        let a = entry("a");

        let mut store = MockOutboxStore::new();
        let entries = vec![a];
        store
            .expect_list_pending()
            .return_once(move |_| Ok(entries));
        // No mark_dispatched, mark_failed, or cleanup expectations: the
        // mock panics if the cancelled sweep touches entry state.

        let transport = MockMessageTransport::new();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = dispatcher(store, transport)
            .run_once(&cancel)
            .await
            .unwrap();
        assert_eq!(report, DispatchReport::default());
    }
}
