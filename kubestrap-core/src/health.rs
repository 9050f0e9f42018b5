//! Readiness waits
//!
//! Every wait in a bootstrap run (API server, DNS and CNI pods, kubelet
//! health, node registration) goes through [`await_condition`]. Checks are
//! plain predicates; a check that errors simply counts as "not yet".

use crate::config::WaitConfig;
use crate::context::{Interruption, RunContext};
use crate::kubectl::{self, PodReadiness};
use crate::runner::CommandRunner;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kubelet health endpoint on every node
pub const KUBELET_HEALTHZ: &str = "http://localhost:10248/healthz";

/// Timeout and poll interval of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn api_server(config: &WaitConfig) -> Self {
        config.api_server().into()
    }

    pub fn pods(config: &WaitConfig) -> Self {
        config.pods().into()
    }

    pub fn node_health(config: &WaitConfig) -> Self {
        config.node_health().into()
    }
}

impl From<(Duration, Duration)> for WaitPolicy {
    fn from((timeout, interval): (Duration, Duration)) -> Self {
        Self::new(timeout, interval)
    }
}

/// Result of a wait. Never an error: callers decide what a timeout means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { elapsed: Duration, polls: u32 },
    TimedOut { elapsed: Duration, polls: u32 },
    Interrupted(Interruption),
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready { .. })
    }
}

/// Poll `check` every `policy.interval` until it returns true or
/// `policy.timeout` elapses.
///
/// The check is always evaluated at least once and once more at the deadline.
/// Each evaluation is bounded by the time left (at least one interval), so a
/// hung command cannot stretch the wait indefinitely. Cancellation and the
/// run deadline end the wait immediately.
pub async fn await_condition<F, Fut>(
    ctx: &RunContext,
    condition: &str,
    policy: WaitPolicy,
    mut check: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut polls = 0u32;

    info!(
        condition = %condition,
        timeout_secs = policy.timeout.as_secs(),
        interval_secs = policy.interval.as_secs(),
        "Waiting for condition"
    );

    loop {
        if let Some(reason) = ctx.interruption() {
            return WaitOutcome::Interrupted(reason);
        }

        polls += 1;
        let bound = deadline
            .saturating_duration_since(Instant::now())
            .max(policy.interval);

        let satisfied = tokio::select! {
            result = tokio::time::timeout(bound, check()) => result.unwrap_or(false),
            reason = ctx.interrupted() => return WaitOutcome::Interrupted(reason),
        };

        let elapsed = start.elapsed();
        if satisfied {
            info!(condition = %condition, elapsed_secs = elapsed.as_secs(), polls, "Condition met");
            return WaitOutcome::Ready { elapsed, polls };
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(condition = %condition, elapsed_secs = elapsed.as_secs(), polls, "Timed out waiting for condition");
            return WaitOutcome::TimedOut { elapsed, polls };
        }

        debug!(condition = %condition, polls, "Condition not met yet");
        let pause = policy.interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            reason = ctx.interrupted() => return WaitOutcome::Interrupted(reason),
        }
    }
}

/// API server answers `/readyz` with `ok`
pub async fn api_server_ready(runner: &dyn CommandRunner) -> bool {
    match runner.run(&kubectl::kubectl("get --raw=/readyz")).await {
        Ok(body) => body.trim() == "ok",
        Err(e) => {
            debug!(error = %e, "API server not reachable yet");
            false
        }
    }
}

/// Readiness of the pods matched by `selector` in `namespace`
pub async fn pod_readiness(
    runner: &dyn CommandRunner,
    namespace: &str,
    selector: &str,
) -> Option<PodReadiness> {
    let cmd = kubectl::kubectl(&format!(
        "get pods -n {} -l {} -o json",
        namespace, selector
    ));
    let json = runner.run(&cmd).await.ok()?;
    match kubectl::parse_pods(&json) {
        Ok(readiness) => {
            debug!(namespace, selector, %readiness, "Pod readiness");
            Some(readiness)
        }
        Err(e) => {
            debug!(error = %e, "Unparseable pod listing");
            None
        }
    }
}

/// Every pod matched by the selector is Ready, and at least one matched
pub async fn pods_ready(runner: &dyn CommandRunner, namespace: &str, selector: &str) -> bool {
    pod_readiness(runner, namespace, selector)
        .await
        .is_some_and(|r| r.is_ready())
}

/// Kubelet health endpoint returns 200
pub async fn kubelet_healthy(runner: &dyn CommandRunner) -> bool {
    let cmd = format!(
        "curl -s -o /dev/null -w '%{{http_code}}' --max-time 5 {}",
        KUBELET_HEALTHZ
    );
    matches!(runner.run(&cmd).await, Ok(code) if code.trim() == "200")
}

/// Run a diagnostic command, folding failures into the text
pub async fn collect_diagnostics(runner: &dyn CommandRunner, cmd: &str) -> String {
    match runner.exec(cmd).await {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => format!(
            "diagnostic command exited with {}: {}",
            output.status,
            output.stderr.trim()
        ),
        Err(e) => format!("diagnostic command failed: {}", e),
    }
}
