//! Bootstrap orchestrator
//!
//! Runs each node's pipeline stage by stage, applying the stage's failure
//! policy, and sequences the nodes: the control plane completes first, then
//! the workers (sequentially or concurrently), then the post-join validator.

use crate::context::RunContext;
use crate::error::BootstrapError;
use crate::provisioner;
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::rollback::{cleanup_on_failure, RollbackPlan};
use crate::runner::{CommandRunner, Connector};
use crate::stages::{control_plane_pipeline, worker_pipeline, Stage, StageError, StagePolicy};
use crate::validator::{self, ValidationReport, VALIDATION_STAGE};
use crate::log_stage;
use futures::future::join_all;
use kubestrap_common::{NodeDescriptor, NodeRole, RunReport, StageResult, StageStatus};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Everything one node's pipeline produced
#[derive(Debug)]
pub struct NodeOutcome {
    pub node: String,
    pub results: Vec<StageResult>,
    pub error: Option<BootstrapError>,
    pub rollback: Option<RollbackPlan>,
}

impl NodeOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a whole run
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub validation: Option<ValidationReport>,
    pub rollbacks: Vec<RollbackPlan>,
    /// First fatal error, in pipeline order
    pub error: Option<BootstrapError>,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<RunReport, BootstrapError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Map a stage failure to the run-level taxonomy
fn classify(stage: Stage, node: &str, attempts: u32, err: StageError) -> BootstrapError {
    match err {
        StageError::Interrupted(reason) => BootstrapError::interrupted(reason, stage.name(), node),
        StageError::ArtifactMissing(path) => BootstrapError::JoinArtifactMissing {
            node: node.to_string(),
            path,
        },
        StageError::Timeout {
            condition,
            waited,
            diagnostics,
        } => BootstrapError::ReadinessTimeout {
            stage: stage.name().to_string(),
            node: node.to_string(),
            condition,
            waited,
            diagnostics,
        },
        other if stage.policy() == StagePolicy::NonIdempotent => {
            BootstrapError::NonIdempotentFailure {
                stage: stage.name().to_string(),
                node: node.to_string(),
                message: other.to_string(),
            }
        }
        other => BootstrapError::StageFailed {
            stage: stage.name().to_string(),
            node: node.to_string(),
            attempts,
            message: other.to_string(),
        },
    }
}

/// Run one stage under its policy.
///
/// Returns the stage record and, for fatal failures, the classified error.
/// Best-effort failures are recorded but never returned as errors.
pub async fn run_stage(
    ctx: &RunContext,
    stage: Stage,
    node: &NodeDescriptor,
    runner: &dyn CommandRunner,
) -> (StageResult, Option<BootstrapError>) {
    let start = Instant::now();
    let hostname = node.hostname.as_str();
    log_stage!(hostname, stage, "Stage started", policy = ?stage.policy());

    let attempt = match stage.policy() {
        StagePolicy::Retry => {
            let policy = RetryPolicy::from(&ctx.config.retry);
            match retry(ctx, &policy, stage.name(), || stage.execute(ctx, node, runner)).await {
                Ok(((), attempts)) => Ok(attempts),
                Err(RetryError::Exhausted { attempts, last }) => Err((attempts, last)),
                Err(RetryError::Interrupted {
                    attempts, reason, ..
                }) => Err((attempts, StageError::Interrupted(reason))),
            }
        }
        _ => match ctx.interruption() {
            Some(reason) => Err((0, StageError::Interrupted(reason))),
            None => tokio::select! {
                biased;
                result = stage.execute(ctx, node, runner) => result.map(|()| 1).map_err(|e| (1, e)),
                reason = ctx.interrupted() => Err((1, StageError::Interrupted(reason))),
            },
        },
    };

    match attempt {
        Ok(attempts) => {
            let result = StageResult::succeeded(stage.name(), hostname, attempts, elapsed_ms(start));
            log_stage!(hostname, stage, "Stage completed", attempts = attempts, status = %result.status);
            (result, None)
        }
        Err((attempts, err))
            if stage.policy() == StagePolicy::BestEffort
                && !matches!(err, StageError::Interrupted(_)) =>
        {
            warn!(node = %hostname, stage = %stage, error = %err, "Best-effort stage failed, continuing");
            let result = StageResult::failed(stage.name(), hostname, attempts, elapsed_ms(start))
                .with_status(StageStatus::BestEffortFailed);
            (result, None)
        }
        Err((attempts, err)) => {
            let result = StageResult::failed(stage.name(), hostname, attempts, elapsed_ms(start));
            let err = classify(stage, hostname, attempts, err);
            error!(node = %hostname, stage = %stage, attempts, error = %err, "Stage failed");
            (result, Some(err))
        }
    }
}

/// Whether a fatal error on a node at or past initialization needs cleanup
fn needs_rollback(err: &BootstrapError) -> bool {
    !matches!(
        err,
        BootstrapError::Cancelled { .. }
            | BootstrapError::DeadlineExceeded { .. }
            | BootstrapError::JoinArtifactMissing { .. }
            | BootstrapError::Configuration(_)
    )
}

/// Run `pipeline` on one node, rolling back on a fatal failure once the node
/// has reached its initialization stage.
pub async fn bootstrap_node(
    ctx: &RunContext,
    node: &NodeDescriptor,
    runner: &dyn CommandRunner,
    pipeline: &[Stage],
) -> NodeOutcome {
    let span = info_span!("bootstrap", run_id = %ctx.run_id, node = %node.hostname, role = %node.role);

    async {
        let mut outcome = NodeOutcome {
            node: node.hostname.clone(),
            results: Vec::with_capacity(pipeline.len()),
            error: None,
            rollback: None,
        };
        let mut initialized = false;

        for &stage in pipeline {
            initialized |= stage.is_initialization();

            let (result, err) = run_stage(ctx, stage, node, runner)
                .instrument(info_span!("stage", stage = stage.name()))
                .await;
            outcome.results.push(result);

            if let Some(err) = err {
                if initialized && needs_rollback(&err) {
                    outcome.rollback =
                        Some(cleanup_on_failure(&node.hostname, stage.name(), runner).await);
                }
                outcome.error = Some(err);
                return outcome;
            }
        }

        info!("Node bootstrapped");
        outcome
    }
    .instrument(span)
    .await
}

/// Drives a full cluster bootstrap
pub struct Orchestrator {
    ctx: RunContext,
    connector: Arc<dyn Connector>,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, connector: Arc<dyn Connector>) -> Self {
        Self { ctx, connector }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Bootstrap a single node with its role's pipeline
    pub async fn bootstrap(&self, node: &NodeDescriptor) -> NodeOutcome {
        let runner = self.connector.connect(node);
        let pipeline = match node.role {
            NodeRole::Control => control_plane_pipeline(),
            NodeRole::Worker => worker_pipeline(),
        };
        bootstrap_node(&self.ctx, node, runner.as_ref(), pipeline).await
    }

    /// Control plane, then workers, then post-join validation
    pub async fn run(&self) -> RunOutcome {
        let mut outcome = RunOutcome {
            report: RunReport::new(self.ctx.run_id.to_string()),
            validation: None,
            rollbacks: Vec::new(),
            error: None,
        };

        let nodes = match provisioner::plan_nodes(&self.ctx.spec) {
            Ok(nodes) => nodes,
            Err(e) => return finish(outcome, Some(e.into())),
        };
        let control = match provisioner::control_node(&nodes) {
            Ok(node) => node.clone(),
            Err(e) => return finish(outcome, Some(e.into())),
        };

        info!(
            run_id = %self.ctx.run_id,
            cluster = %self.ctx.spec.cluster_name,
            workers = nodes.len() - 1,
            "Starting cluster bootstrap"
        );

        // Workers need the join artifact, so the control plane must finish first
        let control_outcome = self.bootstrap(&control).await;
        if let Some(err) = absorb(&mut outcome, control_outcome) {
            return finish(outcome, Some(err));
        }

        let workers: Vec<&NodeDescriptor> = provisioner::worker_nodes(&nodes).collect();
        let mut first_error = None;

        if self.ctx.config.run.parallel_workers {
            let outcomes = join_all(workers.iter().map(|w| self.bootstrap(w))).await;
            for node_outcome in outcomes {
                if let Some(err) = absorb(&mut outcome, node_outcome) {
                    first_error.get_or_insert(err);
                }
            }
        } else {
            for worker in workers {
                if let Some(err) = absorb(&mut outcome, self.bootstrap(worker).await) {
                    first_error = Some(err);
                    break;
                }
            }
        }

        if first_error.is_some() {
            return finish(outcome, first_error);
        }

        let error = self.validate(&nodes, &control, &mut outcome).await;
        finish(outcome, error)
    }

    /// Validate an already bootstrapped cluster without running any pipeline
    pub async fn verify(&self) -> RunOutcome {
        let mut outcome = RunOutcome {
            report: RunReport::new(self.ctx.run_id.to_string()),
            validation: None,
            rollbacks: Vec::new(),
            error: None,
        };

        let nodes = match provisioner::plan_nodes(&self.ctx.spec) {
            Ok(nodes) => nodes,
            Err(e) => return finish(outcome, Some(e.into())),
        };
        let control = match provisioner::control_node(&nodes) {
            Ok(node) => node.clone(),
            Err(e) => return finish(outcome, Some(e.into())),
        };

        let error = self.validate(&nodes, &control, &mut outcome).await;
        finish(outcome, error)
    }

    /// Post-join validation only, recorded as its own stage
    pub async fn validate(
        &self,
        nodes: &[NodeDescriptor],
        control: &NodeDescriptor,
        outcome: &mut RunOutcome,
    ) -> Option<BootstrapError> {
        let start = Instant::now();
        let runner = self.connector.connect(control);

        let result = validator::validate_cluster(&self.ctx, nodes, runner.as_ref())
            .instrument(info_span!("validate", run_id = %self.ctx.run_id))
            .await;

        match result {
            Ok(report) => {
                let error = if report.passed() {
                    outcome.report.stages.push(StageResult::succeeded(
                        VALIDATION_STAGE,
                        &control.hostname,
                        1,
                        elapsed_ms(start),
                    ));
                    info!("Cluster validation passed");
                    None
                } else {
                    outcome.report.stages.push(StageResult::failed(
                        VALIDATION_STAGE,
                        &control.hostname,
                        1,
                        elapsed_ms(start),
                    ));
                    let message = report
                        .failures()
                        .map(|c| format!("{}: {}", c.name, c.message))
                        .collect::<Vec<_>>()
                        .join("; ");
                    error!(failures = %message, "Cluster validation failed");
                    Some(BootstrapError::StageFailed {
                        stage: VALIDATION_STAGE.to_string(),
                        node: control.hostname.clone(),
                        attempts: 1,
                        message,
                    })
                };
                outcome.validation = Some(report);
                error
            }
            Err(reason) => {
                outcome.report.stages.push(StageResult::failed(
                    VALIDATION_STAGE,
                    &control.hostname,
                    0,
                    elapsed_ms(start),
                ));
                Some(BootstrapError::interrupted(
                    reason,
                    VALIDATION_STAGE,
                    &control.hostname,
                ))
            }
        }
    }
}

/// Fold a node's results into the run, returning its error
fn absorb(outcome: &mut RunOutcome, node: NodeOutcome) -> Option<BootstrapError> {
    outcome.report.extend(node.results);
    if let Some(plan) = node.rollback {
        outcome.rollbacks.push(plan);
    }
    node.error
}

fn finish(mut outcome: RunOutcome, error: Option<BootstrapError>) -> RunOutcome {
    outcome.report.finish(error.is_none());
    match &error {
        None => info!(run_id = %outcome.report.run_id, "Cluster bootstrap complete"),
        Some(err) => error!(
            run_id = %outcome.report.run_id,
            stage = err.stage().unwrap_or("-"),
            node = err.node().unwrap_or("-"),
            exit_code = err.exit_code(),
            "Cluster bootstrap failed: {}",
            err
        ),
    }
    outcome.error = error;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_classify() {
        let err = classify(
            Stage::ClusterJoin,
            "node01",
            1,
            StageError::ArtifactMissing(PathBuf::from("configs/join.sh")),
        );
        assert!(matches!(err, BootstrapError::JoinArtifactMissing { .. }));

        let err = classify(
            Stage::ControlPlaneInit,
            "controlplane",
            1,
            StageError::Tooling("kubeadm exploded".into()),
        );
        assert!(matches!(err, BootstrapError::NonIdempotentFailure { .. }));

        let err = classify(
            Stage::ContainerRuntime,
            "node01",
            5,
            StageError::Tooling("apt".into()),
        );
        assert!(matches!(err, BootstrapError::StageFailed { attempts: 5, .. }));

        let err = classify(
            Stage::PodNetwork,
            "controlplane",
            1,
            StageError::Timeout {
                condition: "dns".into(),
                waited: Duration::from_secs(300),
                diagnostics: "listing".into(),
            },
        );
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_interruptions_skip_rollback() {
        assert!(!needs_rollback(&BootstrapError::Cancelled {
            stage: "cluster-join".into(),
            node: "node01".into()
        }));
        assert!(!needs_rollback(&BootstrapError::JoinArtifactMissing {
            node: "node01".into(),
            path: PathBuf::from("configs/join.sh"),
        }));
        assert!(needs_rollback(&BootstrapError::NonIdempotentFailure {
            stage: "control-plane-init".into(),
            node: "controlplane".into(),
            message: "boom".into(),
        }));
    }
}
