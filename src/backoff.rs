use rand::Rng;
use tokio::time::Duration;

pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_FACTOR: u32 = 2;
pub const BACKOFF_MAX_MS: u64 = 60_000;

/// Exponential backoff with ±25% jitter, re-rolled independently per wait.
#[derive(Debug)]
pub struct Backoff {
    base_ms: u64,
    factor: u32,
    max_ms: u64,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            base_ms: BACKOFF_BASE_MS,
            factor: BACKOFF_FACTOR,
            max_ms: BACKOFF_MAX_MS,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failure and return the next wait.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let raw = self
            .base_ms
            .saturating_mul(u64::from(self.factor).saturating_pow(exponent))
            .min(self.max_ms);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let with_jitter = ((raw as f64) * jitter) as u64;
        Duration::from_millis(with_jitter.min(self.max_ms))
    }
}
