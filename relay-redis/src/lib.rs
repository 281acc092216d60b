//! Redis backends: an idempotency store (`SET` with hard expiry, plus an
//! optional moka read-through cache), a retry-queue transport with
//! visibility-timeout leases, and a dead-letter sink.
//!
//! The queue keeps a ready list of message ids, a sorted set of
//! invisible-until deadlines, and per-message hashes for bodies, receipt
//! tokens, and dequeue counts. Receipts guard delete and
//! update-visibility, so a consumer that outlived its lease cannot act
//! on a message that was leased out again.

pub mod config;

use crate::config::{RedisIdempotencyConfig, RedisQueueConfig};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use relay_core::prelude::*;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::error;
use uuid::Uuid;

async fn connect(connection_info: &str) -> Result<MultiplexedConnection, RelayError> {
    let client = redis::Client::open(connection_info)
        .map_err(|e| RelayError::Storage(format!("invalid Redis URL: {e}")))?;
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| {
            error!(error = %e, "Redis connection failed");
            RelayError::Storage("Redis connection failed".to_string())
        })
}

fn storage_err(e: redis::RedisError) -> RelayError {
    error!(error = %e, "Redis query failed");
    RelayError::Storage(e.to_string())
}

fn transport_err(e: redis::RedisError) -> RelayError {
    error!(error = %e, "Redis queue operation failed");
    RelayError::Transport(e.to_string())
}

pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
    #[cfg(feature = "moka")]
    local_cache: moka::future::Cache<String, IdempotencyRecord>,
    config: RedisIdempotencyConfig,
}

impl RedisIdempotencyStore {
    /// Connect to Redis and build the store.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Storage`] if the URL is invalid or the
    /// connection cannot be established.
    pub async fn new(
        connection_info: &str,
        config: RedisIdempotencyConfig,
    ) -> Result<Self, RelayError> {
        let connection = connect(connection_info).await?;
        Ok(Self {
            connection,
            #[cfg(feature = "moka")]
            local_cache: moka::future::Cache::builder()
                .max_capacity(config.local_cache_capacity)
                .time_to_live(config.ttl)
                .build(),
            config,
        })
    }

    fn key(&self, subject_key: &SubjectKey, content_hash: &ContentHash) -> String {
        format!(
            "{}:{}:{}",
            self.config.key_prefix,
            subject_key.as_str(),
            content_hash.as_str()
        )
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(
        &self,
        subject_key: &SubjectKey,
        content_hash: &ContentHash,
    ) -> Result<Option<IdempotencyRecord>, RelayError> {
        let redis_key = self.key(subject_key, content_hash);

        #[cfg(feature = "moka")]
        {
            if let Some(record) = self.local_cache.get(&redis_key).await {
                return Ok(Some(record));
            }
        }

        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;

        raw.map(|json| {
            serde_json::from_str::<IdempotencyRecord>(&json)
                .map_err(|e| RelayError::Storage(format!("corrupt idempotency record: {e}")))
        })
        .transpose()
    }

    async fn upsert(&self, record: IdempotencyRecord) -> Result<(), RelayError> {
        let redis_key = self.key(&record.subject_key, &record.content_hash);
        let json = serde_json::to_string(&record)?;

        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(&redis_key)
            .arg(&json)
            .arg("EX")
            .arg(self.config.ttl.as_secs())
            .query_async::<()>(&mut conn)
            .await
            .map_err(storage_err)?;

        #[cfg(feature = "moka")]
        {
            self.local_cache.insert(redis_key, record).await;
        }
        Ok(())
    }
}

pub struct RedisQueueTransport {
    connection: MultiplexedConnection,
    config: RedisQueueConfig,
}

impl RedisQueueTransport {
    /// Connect to Redis and build the transport.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Storage`] if the URL is invalid or the
    /// connection cannot be established.
    pub async fn new(
        connection_info: &str,
        config: RedisQueueConfig,
    ) -> Result<Self, RelayError> {
        let connection = connect(connection_info).await?;
        Ok(Self { connection, config })
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.config.key_prefix)
    }

    fn invisible_key(&self) -> String {
        format!("{}:invisible", self.config.key_prefix)
    }

    fn bodies_key(&self) -> String {
        format!("{}:bodies", self.config.key_prefix)
    }

    fn receipts_key(&self) -> String {
        format!("{}:receipts", self.config.key_prefix)
    }

    fn counts_key(&self) -> String {
        format!("{}:counts", self.config.key_prefix)
    }

    /// Move messages whose visibility deadline has passed back onto the
    /// ready list.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), RelayError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.invisible_key())
            .arg("-inf")
            .arg(now)
            .query_async(conn)
            .await
            .map_err(transport_err)?;

        for id in due {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("ZREM")
                .arg(self.invisible_key())
                .arg(&id)
                .ignore()
                .cmd("HDEL")
                .arg(self.receipts_key())
                .arg(&id)
                .ignore()
                .cmd("RPUSH")
                .arg(self.ready_key())
                .arg(&id)
                .ignore();
            pipe.query_async::<()>(conn).await.map_err(transport_err)?;
        }
        Ok(())
    }

    /// Confirm the receipt still names the current lease for `id`.
    async fn check_receipt(
        &self,
        conn: &mut MultiplexedConnection,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
    ) -> Result<(), RelayError> {
        let held: Option<String> = redis::cmd("HGET")
            .arg(self.receipts_key())
            .arg(message_id.as_str())
            .query_async(conn)
            .await
            .map_err(transport_err)?;
        match held {
            Some(token) if token == receipt_token.as_str() => Ok(()),
            _ => Err(RelayError::Transport(format!(
                "no lease for message {message_id} with that receipt"
            ))),
        }
    }
}

#[async_trait]
impl MessageTransport for RedisQueueTransport {
    async fn send(&self, body: String) -> Result<(), RelayError> {
        let id = Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.bodies_key())
            .arg(&id)
            .arg(&body)
            .ignore()
            .cmd("RPUSH")
            .arg(self.ready_key())
            .arg(&id)
            .ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(transport_err)
    }

    async fn receive(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueLease>, RelayError> {
        let mut conn = self.connection.clone();
        self.promote_due(&mut conn).await?;

        let deadline =
            OffsetDateTime::now_utc().unix_timestamp() + visibility_timeout.as_secs() as i64;
        let mut leases = Vec::new();

        while (leases.len() as u32) < max_messages {
            let id: Option<String> = redis::cmd("LPOP")
                .arg(self.ready_key())
                .query_async(&mut conn)
                .await
                .map_err(transport_err)?;
            let Some(id) = id else { break };

            let body: Option<String> = redis::cmd("HGET")
                .arg(self.bodies_key())
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(transport_err)?;
            let Some(body) = body else {
                // The message was deleted while its id sat on the ready
                // list; nothing left to lease.
                continue;
            };

            let receipt = Uuid::new_v4().to_string();
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("HSET")
                .arg(self.receipts_key())
                .arg(&id)
                .arg(&receipt)
                .ignore()
                .cmd("HINCRBY")
                .arg(self.counts_key())
                .arg(&id)
                .arg(1)
                .cmd("ZADD")
                .arg(self.invisible_key())
                .arg(deadline)
                .arg(&id)
                .ignore();
            let (dequeue_count,): (u32,) = pipe
                .query_async(&mut conn)
                .await
                .map_err(transport_err)?;

            leases.push(QueueLease {
                message_id: MessageId::new(id),
                receipt_token: ReceiptToken::new(receipt),
                body,
                dequeue_count,
            });
        }
        Ok(leases)
    }

    async fn delete(
        &self,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
    ) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        self.check_receipt(&mut conn, message_id, receipt_token)
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREM")
            .arg(self.invisible_key())
            .arg(message_id.as_str())
            .ignore()
            .cmd("LREM")
            .arg(self.ready_key())
            .arg(0)
            .arg(message_id.as_str())
            .ignore()
            .cmd("HDEL")
            .arg(self.bodies_key())
            .arg(message_id.as_str())
            .ignore()
            .cmd("HDEL")
            .arg(self.receipts_key())
            .arg(message_id.as_str())
            .ignore()
            .cmd("HDEL")
            .arg(self.counts_key())
            .arg(message_id.as_str())
            .ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(transport_err)
    }

    async fn update_visibility(
        &self,
        message_id: &MessageId,
        receipt_token: &ReceiptToken,
        new_body: String,
        delay: Duration,
    ) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        self.check_receipt(&mut conn, message_id, receipt_token)
            .await?;

        let deadline = OffsetDateTime::now_utc().unix_timestamp() + delay.as_secs() as i64;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.bodies_key())
            .arg(message_id.as_str())
            .arg(&new_body)
            .ignore()
            .cmd("ZADD")
            .arg(self.invisible_key())
            .arg(deadline)
            .arg(message_id.as_str())
            .ignore()
            // The lease is spent; the next receive issues a fresh receipt.
            .cmd("HDEL")
            .arg(self.receipts_key())
            .arg(message_id.as_str())
            .ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(transport_err)
    }

    async fn ensure_exists(&self) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(transport_err)
    }
}

/// Dead-letter sink backed by a Redis list.
pub struct RedisDeadLetterSink {
    connection: MultiplexedConnection,
    config: RedisQueueConfig,
}

impl RedisDeadLetterSink {
    /// Connect to Redis and build the sink.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Storage`] if the URL is invalid or the
    /// connection cannot be established.
    pub async fn new(
        connection_info: &str,
        config: RedisQueueConfig,
    ) -> Result<Self, RelayError> {
        let connection = connect(connection_info).await?;
        Ok(Self { connection, config })
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn bury(&self, record: DeadLetterRecord) -> Result<(), RelayError> {
        let json = serde_json::to_string(&record)?;
        let mut conn = self.connection.clone();
        redis::cmd("LPUSH")
            .arg(&self.config.dead_letter_key)
            .arg(&json)
            .query_async::<()>(&mut conn)
            .await
            .map_err(storage_err)
    }
}
