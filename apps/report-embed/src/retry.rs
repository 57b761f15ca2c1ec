use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Linear backoff: the n-th retry waits `base_delay * n`.
pub fn next_delay(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(attempt)
}

pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt < max_attempts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        next_delay(self.base_delay, attempt)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        should_retry(attempt, self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

/// Retries spent on the current dashboard request. Owned by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
}

impl RetryState {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Bumps the counter and returns the attempt number just consumed.
    pub fn record_retry(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}
