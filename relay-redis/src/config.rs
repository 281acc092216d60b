use std::time::Duration;

pub struct RedisIdempotencyConfig {
    /// Hard expiry applied on the Redis side, normally equal to the
    /// guard's TTL.
    pub ttl: Duration,
    pub key_prefix: String,
    #[cfg(feature = "moka")]
    pub local_cache_capacity: u64,
}

impl Default for RedisIdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            key_prefix: "relay:idempotency".to_owned(),
            #[cfg(feature = "moka")]
            local_cache_capacity: 10_000,
        }
    }
}

pub struct RedisQueueConfig {
    /// Prefix under which the queue keeps its ready list, visibility
    /// index, and per-message hashes.
    pub key_prefix: String,
    /// List receiving serialized dead-letter records.
    pub dead_letter_key: String,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relay:retry".to_owned(),
            dead_letter_key: "relay:dead-letters".to_owned(),
        }
    }
}
