//! Convergence polling against the lagging read side.
//!
//! Every assertion about indexed data goes through [`poll_until`]: the probe is
//! re-run on a fixed interval until it succeeds or the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ConvergenceTimeout;

/// Interval and attempt budget for convergence polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    /// 7 attempts, 30 s apart: roughly the 210 s the indexer is given to catch up.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 7,
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Evaluate `probe` until it returns `Ok`, sleeping `config.interval` between
/// attempts.
///
/// A probe error covers both "read side unreachable" and "result not what we
/// expect yet"; either way the probe is retried. After `max_attempts` failed
/// attempts the last error is reported inside [`ConvergenceTimeout`]. No sleep
/// follows the final attempt.
pub async fn poll_until<T, F, Fut>(
    condition: &str,
    config: PollConfig,
    mut probe: F,
) -> Result<T, ConvergenceTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=max_attempts {
        match probe().await {
            Ok(value) => {
                debug!(condition, attempt, "condition converged");
                return Ok(value);
            }
            Err(err) => {
                last_error = format!("{err:#}");
                if attempt < max_attempts {
                    debug!(
                        condition,
                        attempt,
                        error = %last_error,
                        retry_in = ?config.interval,
                        "condition not met yet, retrying"
                    );
                    tokio::time::sleep(config.interval).await;
                }
            }
        }
    }

    warn!(condition, attempts = max_attempts, error = %last_error, "condition never converged");
    Err(ConvergenceTimeout {
        condition: condition.to_string(),
        attempts: max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(max_attempts: u32) -> PollConfig {
        PollConfig::new(Duration::from_secs(30), max_attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_kth_attempt_without_extra_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = calls.clone();
        let started = tokio::time::Instant::now();

        let value = poll_until("member indexed", config(7), || {
            let n = probe_calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= 3 {
                    Ok(n * 10)
                } else {
                    Err(anyhow!("not indexed yet"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 30);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = calls.clone();
        let started = tokio::time::Instant::now();

        let err = poll_until("proposal executed", config(4), || {
            let n = probe_calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(anyhow!("status is dormant (poll {n})")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.condition, "proposal executed");
        assert_eq!(err.last_error, "status is dormant (poll 4)");
        // three sleeps between four attempts
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_does_not_sleep() {
        let started = tokio::time::Instant::now();
        let value = poll_until("noop", PollConfig::default(), || async { Ok("ready") })
            .await
            .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_is_raised_to_one() {
        assert_eq!(PollConfig::new(Duration::from_secs(1), 0).max_attempts, 1);
    }
}
