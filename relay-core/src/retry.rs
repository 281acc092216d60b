use crate::config::RelayConfig;
use crate::object::CorrelationId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Inputs for one retry decision. Constructed per evaluation, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub correlation_id: CorrelationId,
    pub current_retry_count: u32,
    pub max_retry_attempts: u32,
}

impl RetryContext {
    pub fn new(
        correlation_id: CorrelationId,
        current_retry_count: u32,
        max_retry_attempts: u32,
    ) -> Self {
        Self {
            correlation_id,
            current_retry_count,
            max_retry_attempts,
        }
    }
}

/// Exponential backoff with bounded uniform jitter.
///
/// The delay grows as `base^(attempt + 1)` with the base read in minutes,
/// capped at a configured ceiling. Jitter scales the capped delay by
/// `1 + U(0, max_jitter_percentage)` so synchronized consumers do not
/// retry in lockstep.
pub struct RetryStrategy {
    base_delay: Duration,
    use_jitter: bool,
    max_jitter_percentage: f64,
    max_delay: Duration,
    rng: Mutex<StdRng>,
}

impl RetryStrategy {
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Seeded variant so jitter is reproducible under test.
    pub fn with_seed(config: &RelayConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &RelayConfig, rng: StdRng) -> Self {
        Self {
            base_delay: config.base_retry_delay,
            use_jitter: config.use_jitter,
            max_jitter_percentage: config.max_jitter_percentage,
            max_delay: config.max_retry_delay,
            rng: Mutex::new(rng),
        }
    }

    /// True while the context's attempt count is under its budget. No
    /// side effects.
    pub fn should_retry(&self, ctx: &RetryContext) -> bool {
        ctx.current_retry_count < ctx.max_retry_attempts
    }

    /// Delay before the next attempt. Does not enforce the retry cap;
    /// callers check [`RetryStrategy::should_retry`] first. Never zero.
    pub fn next_delay(&self, ctx: &RetryContext) -> Duration {
        let base_minutes = self.base_delay.as_secs_f64() / 60.0;
        let exponent = ctx.current_retry_count.saturating_add(1);
        let max_secs = self.max_delay.as_secs_f64();

        let mut secs = base_minutes.powi(exponent as i32) * 60.0;
        if !secs.is_finite() || secs > max_secs {
            secs = max_secs;
        }

        let mut delay = Duration::from_secs_f64(secs);
        if self.use_jitter && self.max_jitter_percentage > 0.0 {
            let factor = {
                let mut rng = self.rng.lock().expect("jitter rng poisoned");
                1.0 + rng.gen_range(0.0..self.max_jitter_percentage)
            };
            delay = delay.mul_f64(factor);
        }
        delay.max(Duration::from_secs(1))
    }
}
