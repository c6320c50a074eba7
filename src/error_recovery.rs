//! Retry policies for the serial link.
//!
//! The URTSii link recovers from transient failures by re-opening the port and
//! re-writing the frame. The number of attempts is bounded so that no operation
//! blocks its caller for longer than the sum of its per-attempt I/O timeouts.

use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times to try a failed operation in total and how long to
/// wait between attempts.
///
/// # Example
///
/// ```rust
/// use somfy_urts::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// A value of 0 is treated as 1: the operation always runs at least once.
    pub max_attempts: u32,

    /// The delay between attempts.
    ///
    /// Uses a constant backoff strategy.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Default policy: 3 attempts with 100ms between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy for opening the port: one try plus one retry.
    pub fn connect(backoff_delay: Duration) -> Self {
        Self {
            max_attempts: 2,
            backoff_delay,
        }
    }

    /// Policy for writing a frame: up to three full connect+write cycles.
    pub fn send(backoff_delay: Duration) -> Self {
        Self {
            max_attempts: 3,
            backoff_delay,
        }
    }

    /// Number of attempts this policy allows (never less than one).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait before the given 1-based attempt. The first attempt never waits.
    pub async fn pause_before(&self, attempt: u32) {
        if attempt > 1 && !self.backoff_delay.is_zero() {
            sleep(self.backoff_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_policies() {
        let connect = RetryPolicy::connect(Duration::ZERO);
        let send = RetryPolicy::send(Duration::from_millis(50));
        assert_eq!(connect.attempts(), 2);
        assert_eq!(send.attempts(), 3);
        assert_eq!(send.backoff_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff_delay: Duration::ZERO,
        };
        assert_eq!(policy.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_only_between_attempts() {
        let policy = RetryPolicy::default();
        let start = tokio::time::Instant::now();

        policy.pause_before(1).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        policy.pause_before(2).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
