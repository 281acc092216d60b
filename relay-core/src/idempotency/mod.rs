mod fingerprint;

pub use fingerprint::content_hash;

use crate::error::RelayError;
use crate::model::{IdempotencyRecord, ProcessedOutcome};
use crate::object::{ContentHash, SubjectKey};
use crate::storage::IdempotencyStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Suppresses duplicate work for a (subject, content) fingerprint inside
/// a bounded time window.
///
/// Expiry is soft: a record older than the TTL reads as absent and is
/// left in place; a later `mark_processed` for the same key overwrites it
/// and restarts the window.
pub struct IdempotencyGuard<I> {
    store: Arc<I>,
    ttl: Duration,
}

impl<I> IdempotencyGuard<I>
where
    I: IdempotencyStore,
{
    pub fn new(store: Arc<I>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn has_been_processed(
        &self,
        subject_key: &SubjectKey,
        content_hash: &ContentHash,
    ) -> Result<bool, RelayError> {
        let Some(record) = self.store.get(subject_key, content_hash).await? else {
            return Ok(false);
        };
        let age = OffsetDateTime::now_utc() - record.processed_at;
        Ok(age < time::Duration::seconds_f64(self.ttl.as_secs_f64()))
    }

    pub async fn mark_processed(
        &self,
        subject_key: SubjectKey,
        content_hash: ContentHash,
        outcome: ProcessedOutcome,
    ) -> Result<(), RelayError> {
        self.store
            .upsert(IdempotencyRecord {
                subject_key,
                content_hash,
                processed_at: OffsetDateTime::now_utc(),
                outcome,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Payload;
    use crate::storage::MockIdempotencyStore;
    use serde_json::json;

    fn key() -> (SubjectKey, ContentHash) {
        let subject = SubjectKey::new("doc-a-17");
        let hash = content_hash(&Payload::new(json!({"doc": "a-17"}))).unwrap();
        (subject, hash)
    }

    fn record(age: time::Duration) -> IdempotencyRecord {
        let (subject_key, hash) = key();
        IdempotencyRecord {
            subject_key,
            content_hash: hash,
            processed_at: OffsetDateTime::now_utc() - age,
            outcome: ProcessedOutcome::Enqueued,
        }
    }

    #[tokio::test]
    async fn fresh_record_is_a_hit() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_get()
            .returning(|_, _| Ok(Some(record(time::Duration::minutes(5)))));

        let guard = IdempotencyGuard::new(Arc::new(store), Duration::from_secs(24 * 60 * 60));
        let (subject, hash) = key();
        assert!(guard.has_been_processed(&subject, &hash).await.unwrap());
    }

    #[tokio::test]
    async fn expired_record_reads_as_absent() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_get()
            .returning(|_, _| Ok(Some(record(time::Duration::hours(25)))));

        let guard = IdempotencyGuard::new(Arc::new(store), Duration::from_secs(24 * 60 * 60));
        let (subject, hash) = key();
        assert!(!guard.has_been_processed(&subject, &hash).await.unwrap());
    }

    #[tokio::test]
    async fn missing_record_is_a_miss() {
        let mut store = MockIdempotencyStore::new();
        store.expect_get().returning(|_, _| Ok(None));

        let guard = IdempotencyGuard::new(Arc::new(store), Duration::from_secs(60));
        let (subject, hash) = key();
        assert!(!guard.has_been_processed(&subject, &hash).await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_upserts_a_now_stamped_record() {
        let (subject, hash) = key();
        let expected_subject = subject.clone();

        let mut store = MockIdempotencyStore::new();
        store
            .expect_upsert()
            .withf(move |r: &IdempotencyRecord| {
                r.subject_key == expected_subject
                    && r.outcome == ProcessedOutcome::Delivered
                    && (OffsetDateTime::now_utc() - r.processed_at) < time::Duration::seconds(5)
            })
            .times(1)
            .returning(|_| Ok(()));

        let guard = IdempotencyGuard::new(Arc::new(store), Duration::from_secs(60));
        guard
            .mark_processed(subject, hash, ProcessedOutcome::Delivered)
            .await
            .unwrap();
    }
}
