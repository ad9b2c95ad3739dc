//! Retry schedules for resilient operations
//!
//! Probes use a tiered schedule (short delay, then a longer one) so a
//! transient blip is not reported as an outage; sinks and clients use
//! exponential backoff; coordination and store loops use a fixed delay.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay policy between attempts of one operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetrySchedule {
    /// Same delay before every retry
    Fixed { delay: Duration, max_retries: u32 },

    /// Explicit delay per retry; its length bounds the retries
    Tiered(Vec<Duration>),

    /// `base * multiplier^(n-1)`, capped at `max_delay`
    Exponential {
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::Exponential {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetrySchedule {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self::Fixed { delay, max_retries }
    }

    pub fn tiered(delays: impl Into<Vec<Duration>>) -> Self {
        Self::Tiered(delays.into())
    }

    /// Exponential backoff doubling from `base_delay`
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            max_retries,
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Fixed { max_retries, .. } | Self::Exponential { max_retries, .. } => *max_retries,
            Self::Tiered(delays) => delays.len() as u32,
        }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries() + 1
    }

    /// Delay before `attempt` (0 is the first attempt and never waits)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Fixed { delay, .. } => *delay,
            Self::Tiered(delays) => delays
                .get(attempt as usize - 1)
                .or(delays.last())
                .copied()
                .unwrap_or_default(),
            Self::Exponential {
                base_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let exponential = base_delay.as_millis() as f64 * multiplier.powi(attempt as i32 - 1);
                Duration::from_millis(exponential as u64).min(*max_delay)
            }
        }
    }
}

/// Execute an operation, retrying on error according to `schedule`
///
/// Returns the first success or the last error once attempts run out.
pub async fn with_retry<T, E, F, Fut>(schedule: &RetrySchedule, operation: F) -> Result<T, E>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(schedule, operation, |_| true).await
}

/// Like [`with_retry`], but stops early on errors `should_retry` rejects
pub async fn with_retry_if<T, E, F, Fut, P>(
    schedule: &RetrySchedule,
    operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = schedule.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying operation after delay");
            tokio::time::sleep(delay).await;
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    warn!(error = %e, "Non-retryable error encountered");
                    return Err(e);
                }
                if attempt >= schedule.max_retries() {
                    return Err(e);
                }
                debug!(attempt, max_retries = schedule.max_retries(), error = %e, "Operation failed, will retry");
                attempt += 1;
            }
        }
    }
}
