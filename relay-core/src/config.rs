use std::time::Duration;

/// Backoff applied by the outbox store when a dispatch attempt fails:
/// `next_retry_at = now + base_delay * doubling_factor^(retry_count - 1)`.
/// Once `retry_count` exceeds `max_retries` the entry is abandoned.
#[derive(Debug, Clone)]
pub struct OutboxRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub doubling_factor: u32,
}

impl Default for OutboxRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2 * 60),
            doubling_factor: 2,
        }
    }
}

impl OutboxRetryPolicy {
    /// Delay before the given (already incremented) retry attempt.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = self
            .doubling_factor
            .saturating_pow(retry_count.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redelivery budget per message on the retry queue.
    pub max_retry_attempts: u32,
    /// Base of the exponential redelivery delay, interpreted in minutes:
    /// delay = base^(attempt + 1).
    pub base_retry_delay: Duration,
    pub use_jitter: bool,
    /// Upper bound of the uniform jitter factor, as a fraction of the delay.
    pub max_jitter_percentage: f64,
    /// Ceiling on the exponential term; base^(n+1) overtakes any budget
    /// quickly for bases above two.
    pub max_retry_delay: Duration,
    pub max_messages_per_batch: u32,
    /// Visibility timeout used when leasing retry-queue messages.
    pub processing_visibility_timeout: Duration,
    /// Dispatched entries older than this are removed by cleanup.
    pub cleanup_retention_period: Duration,
    pub idempotency_ttl: Duration,
    /// How often the outbox dispatcher sweeps.
    pub dispatch_interval: Duration,
    /// How often the retry orchestrator sweeps the poison queue.
    pub retry_poll_interval: Duration,
    pub dispatch_retry: OutboxRetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_retry_delay: Duration::from_secs(2 * 60),
            use_jitter: true,
            max_jitter_percentage: 0.3,
            max_retry_delay: Duration::from_secs(60 * 60),
            max_messages_per_batch: 10,
            processing_visibility_timeout: Duration::from_secs(5 * 60),
            cleanup_retention_period: Duration::from_secs(30 * 24 * 60 * 60),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            dispatch_interval: Duration::from_secs(10),
            retry_poll_interval: Duration::from_secs(30),
            dispatch_retry: OutboxRetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_backoff_doubles_per_attempt() {
        let policy = OutboxRetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(2), Duration::from_secs(240));
        assert_eq!(policy.backoff(3), Duration::from_secs(480));
    }
}
