//! # Backoff Controller
//!
//! Bounded exponential backoff around one fallible operation.
//!
//! ## Schedule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Default Retry Policy                                 │
//! │                                                                         │
//! │  attempt   1    2    3    4     5     6     7     8     9     10        │
//! │            │    │    │    │     │     │     │     │     │     │         │
//! │  delay     └─2s─┴─4s─┴─8s─┴─16s─┴─30s─┴─30s─┴─30s─┴─30s─┴─30s─┘         │
//! │                                                                         │
//! │  • initial 2s, doubling, capped at 30s (no jitter)                     │
//! │  • at most 10 attempts, 180s of waiting in total                       │
//! │  • only transient errors are retried, anything else aborts at once     │
//! │  • after the last attempt the last error is returned unchanged         │
//! │  • every sleep yields to the CancellationToken                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Retry Policy
// =============================================================================

/// Parameters of the backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Creates the exponential backoff for one `run`.
    fn create_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None, // bounded by attempts, not time
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    /// The delays slept between attempts, in order.
    ///
    /// Has `max_attempts - 1` entries.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut backoff = self.create_backoff();
        (1..self.max_attempts)
            .map(|_| backoff.next_backoff().unwrap_or(self.max_delay))
            .collect()
    }
}

// =============================================================================
// Backoff Controller
// =============================================================================

/// Repeats an operation while it fails transiently.
///
/// Cheap to clone; all clones share the cancellation token.
#[derive(Debug, Clone)]
pub struct BackoffController {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl BackoffController {
    /// Creates a controller with the given policy.
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        BackoffController { policy, cancel }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// ## Errors
    /// - The first non-transient error, unchanged
    /// - The last transient error once `max_attempts` is reached
    /// - [`SyncError::ShuttingDown`] if cancelled while waiting
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut backoff = self.policy.create_backoff();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt_no = 0u32;

        loop {
            attempt_no += 1;

            let err = match attempt().await {
                Ok(value) => {
                    if attempt_no > 1 {
                        info!(operation, attempt = attempt_no, "Recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                debug!(operation, error = %err, "Permanent failure, not retrying");
                return Err(err);
            }

            if attempt_no >= max_attempts {
                error!(
                    operation,
                    attempts = attempt_no,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
            warn!(
                operation,
                attempt = attempt_no,
                max_attempts,
                ?delay,
                error = %err,
                "Transient failure, backing off"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(operation, "Shutdown during backoff");
                    return Err(SyncError::ShuttingDown);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn controller() -> BackoffController {
        BackoffController::new(RetryPolicy::default(), CancellationToken::new())
    }

    #[test]
    fn test_default_schedule() {
        let secs: Vec<u64> = RetryPolicy::default()
            .schedule()
            .iter()
            .map(Duration::as_secs)
            .collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: SyncResult<()> = controller()
            .run("probe", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(SyncError::ConnectionFailed(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(start.elapsed().as_secs(), 180);
        match result {
            Err(SyncError::ConnectionFailed(msg)) => assert_eq!(msg, "attempt 10"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: SyncResult<()> = controller()
            .run("probe", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::ProtocolViolation("bad frame".into())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::ProtocolViolation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = controller()
            .run("probe", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(SyncError::Timeout(10))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(start.elapsed().as_secs(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let retry = BackoffController::new(RetryPolicy::default(), cancel.clone());
        cancel.cancel();

        let result: SyncResult<()> = retry
            .run("probe", || async { Err(SyncError::Disconnected) })
            .await;

        assert!(matches!(result, Err(SyncError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let retry = BackoffController::new(policy, CancellationToken::new());

        let result: SyncResult<()> = retry
            .run("probe", || async { Err(SyncError::Disconnected) })
            .await;

        assert!(matches!(result, Err(SyncError::Disconnected)));
    }
}
