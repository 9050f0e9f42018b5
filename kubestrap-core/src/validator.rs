//! Post-join cluster validation
//!
//! Runs once every pipeline has finished: all planned nodes must be registered
//! and Ready, and the system, DNS and CNI pods must be fully ready.

use crate::context::{Interruption, RunContext};
use crate::health::{await_condition, WaitOutcome, WaitPolicy};
use crate::kubectl::{self, kubectl, NodeState, PodReadiness};
use crate::runner::CommandRunner;
use kubestrap_common::NodeDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Stage name under which validation results are reported
pub const VALIDATION_STAGE: &str = "post-join-validation";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl ValidationCheck {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Compare registered nodes against the plan
pub fn evaluate_nodes(expected: &[NodeDescriptor], registered: &[NodeState]) -> ValidationCheck {
    let registered_names: HashSet<&str> = registered.iter().map(|n| n.name.as_str()).collect();

    let missing: Vec<&str> = expected
        .iter()
        .map(|n| n.hostname.as_str())
        .filter(|h| !registered_names.contains(h))
        .collect();

    let not_ready: Vec<&str> = registered
        .iter()
        .filter(|n| !n.ready)
        .map(|n| n.name.as_str())
        .collect();

    let ready = registered.iter().filter(|n| n.ready).count();

    if missing.is_empty() && not_ready.is_empty() && ready == expected.len() {
        ValidationCheck::pass("nodes-ready", format!("{}/{} nodes Ready", ready, expected.len()))
    } else {
        let mut message = format!("{}/{} nodes Ready", ready, expected.len());
        if !missing.is_empty() {
            message.push_str(&format!("; not registered: {}", missing.join(", ")));
        }
        if !not_ready.is_empty() {
            message.push_str(&format!("; not Ready: {}", not_ready.join(", ")));
        }
        ValidationCheck::fail("nodes-ready", message)
    }
}

/// Judge a pod tally, optionally requiring an exact pod count. Finished job
/// pods are accepted only when `allow_completed` is set.
pub fn evaluate_pods(
    name: &str,
    readiness: &PodReadiness,
    expected: Option<usize>,
    allow_completed: bool,
) -> ValidationCheck {
    let count_ok = expected.map_or(true, |n| readiness.matched == n);
    let ready = if allow_completed {
        readiness.is_settled()
    } else {
        readiness.is_ready()
    };
    if ready && count_ok {
        return ValidationCheck::pass(name, readiness.to_string());
    }

    let mut message = readiness.to_string();
    if let Some(n) = expected.filter(|_| !count_ok) {
        message.push_str(&format!("; expected {} pods", n));
    }
    if !readiness.not_ready.is_empty() {
        message.push_str(&format!("; not ready: {}", readiness.not_ready.join(", ")));
    }
    ValidationCheck::fail(name, message)
}

async fn observe_nodes(runner: &dyn CommandRunner) -> Option<Vec<NodeState>> {
    let json = runner.run(&kubectl("get nodes -o json")).await.ok()?;
    kubectl::parse_nodes(&json).ok()
}

async fn observe_pods(runner: &dyn CommandRunner, args: &str) -> Option<PodReadiness> {
    let json = runner
        .run(&kubectl(&format!("get pods {} -o json", args)))
        .await
        .ok()?;
    kubectl::parse_pods(&json).ok()
}

/// Wait for one check to pass, then record its final observation
async fn settle<F, Fut>(
    ctx: &RunContext,
    name: &str,
    mut observe: F,
) -> Result<ValidationCheck, Interruption>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ValidationCheck>,
{
    let outcome = await_condition(ctx, name, WaitPolicy::pods(&ctx.config.waits), || {
        let check = observe();
        async move { check.await.passed }
    })
    .await;

    if let WaitOutcome::Interrupted(reason) = outcome {
        return Err(reason);
    }

    let check = observe().await;
    if check.passed {
        info!(check = %check.name, "{}", check.message);
    } else {
        warn!(check = %check.name, "{}", check.message);
    }
    Ok(check)
}

/// Run every post-join check through the control node's runner
pub async fn validate_cluster(
    ctx: &RunContext,
    nodes: &[NodeDescriptor],
    control: &dyn CommandRunner,
) -> Result<ValidationReport, Interruption> {
    let mut report = ValidationReport::default();

    report.checks.push(
        settle(ctx, "nodes-ready", || async move {
            match observe_nodes(control).await {
                Some(states) => evaluate_nodes(nodes, &states),
                None => ValidationCheck::fail("nodes-ready", "node listing unavailable"),
            }
        })
        .await?,
    );

    // The whole namespace may hold finished job pods; the selectors may not
    let pod_checks: [(&str, &str, Option<usize>, bool); 3] = [
        ("kube-system-pods", "-n kube-system", None, true),
        ("dns-pods", "-n kube-system -l k8s-app=kube-dns", None, false),
        (
            "cni-pods",
            "-n kube-system -l k8s-app=calico-node",
            Some(nodes.len()),
            false,
        ),
    ];

    for (name, args, expected, allow_completed) in pod_checks {
        report.checks.push(
            settle(ctx, name, || async move {
                match observe_pods(control, args).await {
                    Some(readiness) => evaluate_pods(name, &readiness, expected, allow_completed),
                    None => ValidationCheck::fail(name, "pod listing unavailable"),
                }
            })
            .await?,
        );
    }

    Ok(report)
}
