use std::time::Duration;

/// Exponential backoff between attempts of a transiently failing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (1-based) failed: `base * 2^(attempt - 1)`,
    /// capped at `max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
