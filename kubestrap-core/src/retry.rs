//! Fixed-backoff retry for idempotent operations.
//!
//! Package installs fail transiently (mirror hiccups, apt locks), so they are
//! re-run a bounded number of times with a constant pause in between. The pause
//! is abandoned as soon as the run is cancelled or its deadline passes.

use std::time::Duration;

use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::context::{Interruption, RunContext};

/// Bounded attempts with a constant delay between them
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay between consecutive attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt, no retry
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff())
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error
    Exhausted { attempts: u32, last: E },
    /// The run was cancelled or timed out between attempts
    Interrupted {
        attempts: u32,
        reason: Interruption,
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Interrupted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Returns the value together with the number of attempts it took.
pub async fn retry<F, Fut, T, E>(
    ctx: &RunContext,
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut last = None;

    loop {
        if let Some(reason) = ctx.interruption() {
            return Err(RetryError::Interrupted {
                attempts: attempt,
                reason,
                last,
            });
        }

        attempt += 1;

        // Dropping an in-flight attempt kills its child process
        let result = tokio::select! {
            biased;
            result = operation() => result,
            reason = ctx.interrupted() => {
                return Err(RetryError::Interrupted {
                    attempts: attempt,
                    reason,
                    last,
                });
            }
        };

        match result {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    delay_secs = policy.backoff.as_secs(),
                    "Operation failed, retrying"
                );
                last = Some(e);

                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff) => {}
                    reason = ctx.interrupted() => {
                        return Err(RetryError::Interrupted {
                            attempts: attempt,
                            reason,
                            last,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KubestrapConfig;
    use crate::settings::tests::sample_spec;
    use crate::shutdown::ShutdownCoordinator;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn ctx() -> RunContext {
        RunContext::detached(sample_spec(), KubestrapConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_immediately() {
        let result: Result<(i32, u32), RetryError<&str>> =
            retry(&ctx(), &RetryPolicy::default(), "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), (42, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_with_fixed_backoff() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = Instant::now();

        let result: Result<(u32, u32), RetryError<String>> =
            retry(&ctx(), &RetryPolicy::default(), "op", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("attempt {} failed", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), (3, 3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // Two pauses of exactly the configured backoff
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<((), u32), RetryError<String>> =
            retry(&ctx(), &RetryPolicy::default(), "op", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {}", n))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last, "failure 5");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_does_not_retry() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<((), u32), RetryError<&str>> =
            retry(&ctx(), &RetryPolicy::once(), "op", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let coordinator = ShutdownCoordinator::new();
        let ctx = RunContext::new(
            Arc::new(sample_spec()),
            Arc::new(KubestrapConfig::default()),
            coordinator.subscribe(),
        );

        let trigger = coordinator.clone();
        let result: Result<((), u32), RetryError<&str>> =
            retry(&ctx, &RetryPolicy::default(), "op", || {
                trigger.shutdown();
                async { Err("flaky") }
            })
            .await;

        match result {
            Err(RetryError::Interrupted {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, Interruption::Cancelled);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_hung_attempt() {
        let ctx = ctx().with_deadline(Instant::now() + Duration::from_secs(60));
        let start = Instant::now();

        let result: Result<((), u32), RetryError<&str>> =
            retry(&ctx, &RetryPolicy::default(), "op", std::future::pending).await;

        match result {
            Err(RetryError::Interrupted {
                attempts,
                reason,
                last,
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, Interruption::DeadlineExceeded);
                assert!(last.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }
}
