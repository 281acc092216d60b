//! In-memory backends: the reference implementations used by the demo
//! binaries and integration tests. Semantics match the persistent
//! backends, including version checks and visibility windows.

use crate::config::OutboxRetryPolicy;
use crate::error::RelayError;
use crate::model::{
    DeadLetterRecord, EntryStatus, IdempotencyRecord, OutboxEntry, QueueLease,
};
use crate::object::{
    ContentHash, CorrelationId, EntryId, MessageId, MessageType, Payload, ReceiptToken, SubjectKey,
    Version,
};
use crate::storage::{IdempotencyStore, OutboxStore};
use crate::transport::{DeadLetterSink, MessageTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use uuid::Uuid;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct InMemoryOutboxStore {
    entries: Mutex<Vec<OutboxEntry>>,
    policy: OutboxRetryPolicy,
}

impl InMemoryOutboxStore {
    pub fn new(policy: OutboxRetryPolicy) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            policy,
        }
    }

    /// Snapshot of one entry, mostly for assertions and demos.
    pub fn entry(&self, id: EntryId) -> Option<OutboxEntry> {
        lock(&self.entries).iter().find(|e| e.id == id).cloned()
    }

    fn update<F>(&self, id: EntryId, expected_version: Version, apply: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut OutboxEntry),
    {
        let mut entries = lock(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(RelayError::NotFound(id))?;
        if entry.version != expected_version {
            return Err(RelayError::Conflict(id));
        }
        apply(entry);
        entry.version = entry.version.next();
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(
        &self,
        message_type: MessageType,
        payload: Payload,
        correlation_id: CorrelationId,
    ) -> Result<EntryId, RelayError> {
        let entry = OutboxEntry::new(message_type, payload, correlation_id);
        let id = entry.id;
        lock(&self.entries).push(entry);
        Ok(id)
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>, RelayError> {
        let entries = lock(&self.entries);
        let mut pending: Vec<OutboxEntry> = entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Pending | EntryStatus::Failed))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_uuid().cmp(b.id.as_uuid()))
        });
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_dispatched(
        &self,
        id: EntryId,
        expected_version: Version,
    ) -> Result<(), RelayError> {
        self.update(id, expected_version, |entry| {
            entry.status = EntryStatus::Dispatched;
            entry.dispatched_at = Some(OffsetDateTime::now_utc());
        })
    }

    async fn mark_failed(
        &self,
        id: EntryId,
        expected_version: Version,
        error_message: &str,
    ) -> Result<(), RelayError> {
        let policy = self.policy.clone();
        self.update(id, expected_version, |entry| {
            entry.retry_count += 1;
            entry.last_error = Some(error_message.to_string());
            if entry.retry_count > policy.max_retries {
                entry.status = EntryStatus::Abandoned;
                entry.abandoned_at = Some(OffsetDateTime::now_utc());
                entry.next_retry_at = None;
            } else {
                entry.status = EntryStatus::Failed;
                let backoff = policy.backoff(entry.retry_count);
                entry.next_retry_at = Some(
                    OffsetDateTime::now_utc()
                        + time::Duration::seconds_f64(backoff.as_secs_f64()),
                );
            }
        })
    }

    async fn cleanup_dispatched(&self, retention_period: Duration) -> Result<u64, RelayError> {
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::seconds_f64(retention_period.as_secs_f64());
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|e| {
            !(e.status == EntryStatus::Dispatched
                && e.dispatched_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<(SubjectKey, ContentHash), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(
        &self,
        subject_key: &SubjectKey,
        content_hash: &ContentHash,
    ) -> Result<Option<IdempotencyRecord>, RelayError> {
        Ok(lock(&self.records)
            .get(&(subject_key.clone(), content_hash.clone()))
            .cloned())
    }

    async fn upsert(&self, record: IdempotencyRecord) -> Result<(), RelayError> {
        lock(&self.records).insert(
            (record.subject_key.clone(), record.content_hash.clone()),
            record,
        );
        Ok(())
    }
}

struct QueuedMessage {
    id: MessageId,
    body: String,
    dequeue_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptToken>,
}

/// Queue with visibility-timeout lease semantics, all in process.
#[derive(Default)]
pub struct InMemoryQueueTransport {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl InMemoryQueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages still on the queue, visible or not.
    pub fn queued_len(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[async_trait]
impl MessageTransport for InMemoryQueueTransport {
    async fn send(&self, body: String) -> Result<(), RelayError> {
        lock(&self.messages).push(QueuedMessage {
            id: MessageId::new(Uuid::new_v4().to_string()),
            body,
            dequeue_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueLease>, RelayError> {
        let now = Instant::now();
        let mut messages = lock(&self.messages);
        let mut leases = Vec::new();
        for message in messages.iter_mut() {
            if leases.len() as u32 >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let receipt = ReceiptToken::new(Uuid::new_v4().to_string());
            message.receipt = Some(receipt.clone());
            message.dequeue_count += 1;
            message.visible_at = now + visibility_timeout;
            leases.push(QueueLease {
                message_id: message.id.clone(),
                receipt_token: receipt,
                body: message.body.clone(),
                dequeue_count: message.dequeue_count,
            });
        }
        Ok(leases)
    }

    async fn delete(
        &self,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
    ) -> Result<(), RelayError> {
        let mut messages = lock(&self.messages);
        let held = messages
            .iter()
            .position(|m| m.id == *message_id && m.receipt.as_ref() == Some(receipt_token));
        match held {
            Some(index) => {
                messages.remove(index);
                Ok(())
            }
            None => Err(RelayError::Transport(format!(
                "no lease for message {message_id} with that receipt"
            ))),
        }
    }

    async fn update_visibility(
        &self,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
        new_body: String,
        delay: Duration,
    ) -> Result<(), RelayError> {
        let mut messages = lock(&self.messages);
        let message = messages
            .iter_mut()
            .find(|m| m.id == *message_id && m.receipt.as_ref() == Some(receipt_token))
            .ok_or_else(|| {
                RelayError::Transport(format!(
                    "no lease for message {message_id} with that receipt"
                ))
            })?;
        message.body = new_body;
        message.visible_at = Instant::now() + delay;
        // The lease is spent; the next receive issues a fresh receipt.
        message.receipt = None;
        Ok(())
    }

    async fn ensure_exists(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Dead-letter sink that keeps records in memory for inspection.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn bury(&self, record: DeadLetterRecord) -> Result<(), RelayError> {
        lock(&self.records).push(record);
        Ok(())
    }
}
