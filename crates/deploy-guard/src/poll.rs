//! Bounded waiting: per-call timeouts and fixed-interval status polling.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PollTimeout;

/// Fixed-interval poll with a hard attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two status checks
    pub interval: Duration,
    /// Status checks before giving up
    pub max_attempts: u32,
}

impl PollPolicy {
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent waiting between checks.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 60)
    }
}

/// Run `fut`, failing if it takes longer than `limit`.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{operation} timed out after {}s", limit.as_secs_f64())),
    }
}

/// Call `check` until it reports `true` or the policy's attempts run out.
///
/// A check that errors counts as an attempt; the error is logged and polling
/// continues. Exhausting the attempts yields a [`PollTimeout`].
pub async fn poll_until<F, Fut>(policy: PollPolicy, operation: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=policy.max_attempts {
        match check().await {
            Ok(true) => {
                debug!(operation = %operation, attempt, "Poll condition met");
                return Ok(());
            }
            Ok(false) => {
                debug!(operation = %operation, attempt, max = policy.max_attempts, "Not ready yet");
            }
            Err(e) => {
                warn!(operation = %operation, attempt, error = %e, "Status check failed");
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(PollTimeout {
        operation: operation.to_string(),
        attempts: policy.max_attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_when_condition_met() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = PollPolicy::new(Duration::from_secs(2), 5);
        poll_until(policy, "rollout", move || async move {
            Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = PollPolicy::new(Duration::from_secs(1), 4);
        let err = poll_until(policy, "rollout", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let timeout = err.downcast_ref::<PollTimeout>().unwrap();
        assert_eq!(timeout.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_consume_attempts() {
        let policy = PollPolicy::new(Duration::from_secs(1), 2);
        let err = poll_until(policy, "sync", || async { Err(anyhow!("connection refused")) })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<PollTimeout>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_bounds_slow_calls() {
        let err = with_timeout(Duration::from_secs(1), "slow call", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("slow call timed out"));
    }

    #[test]
    fn test_budget() {
        assert_eq!(
            PollPolicy::new(Duration::from_secs(10), 30).budget(),
            Duration::from_secs(290)
        );
    }
}
