//! Provisioning stages
//!
//! A stage is one ordered step of a node's pipeline. Each stage carries the
//! policy the orchestrator applies when it fails; the scripts themselves live
//! in the role-specific submodules.

mod common;
mod control;
mod worker;

pub use common::{
    container_runtime_script, kubernetes_tooling_script, prerequisites_script,
    system_tuning_script,
};
pub use control::{aux_tooling_scripts, calico_manifest_url, init_script};
pub use worker::{join_script, node_exporter_script};

use crate::context::{Interruption, RunContext};
use crate::health::WaitOutcome;
use crate::runner::{CommandError, CommandRunner};
use kubestrap_common::NodeDescriptor;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How the orchestrator treats a failing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    /// Fail the pipeline on the first error
    FailFast,
    /// Idempotent: re-run with fixed backoff up to the retry ceiling
    Retry,
    /// Never re-run; failure triggers rollback
    NonIdempotent,
    /// Log the failure and continue
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prerequisites,
    ContainerRuntime,
    KubernetesTooling,
    ControlPlaneInit,
    ApiServerReady,
    PodNetwork,
    JoinToken,
    AuxiliaryTooling,
    SystemTuning,
    ClusterJoin,
    MonitoringAgent,
    NodeHealth,
}

const CONTROL_PLANE_PIPELINE: &[Stage] = &[
    Stage::Prerequisites,
    Stage::ContainerRuntime,
    Stage::KubernetesTooling,
    Stage::ControlPlaneInit,
    Stage::ApiServerReady,
    Stage::PodNetwork,
    Stage::JoinToken,
    Stage::AuxiliaryTooling,
];

const WORKER_PIPELINE: &[Stage] = &[
    Stage::Prerequisites,
    Stage::ContainerRuntime,
    Stage::KubernetesTooling,
    Stage::SystemTuning,
    Stage::ClusterJoin,
    Stage::MonitoringAgent,
    Stage::NodeHealth,
];

pub fn control_plane_pipeline() -> &'static [Stage] {
    CONTROL_PLANE_PIPELINE
}

pub fn worker_pipeline() -> &'static [Stage] {
    WORKER_PIPELINE
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prerequisites => "prerequisites",
            Stage::ContainerRuntime => "container-runtime",
            Stage::KubernetesTooling => "kubernetes-tooling",
            Stage::ControlPlaneInit => "control-plane-init",
            Stage::ApiServerReady => "api-server-ready",
            Stage::PodNetwork => "pod-network",
            Stage::JoinToken => "join-token",
            Stage::AuxiliaryTooling => "auxiliary-tooling",
            Stage::SystemTuning => "system-tuning",
            Stage::ClusterJoin => "cluster-join",
            Stage::MonitoringAgent => "monitoring-agent",
            Stage::NodeHealth => "node-health",
        }
    }

    pub fn policy(&self) -> StagePolicy {
        match self {
            Stage::ContainerRuntime | Stage::KubernetesTooling | Stage::MonitoringAgent => {
                StagePolicy::Retry
            }
            Stage::ControlPlaneInit | Stage::ClusterJoin => StagePolicy::NonIdempotent,
            Stage::AuxiliaryTooling => StagePolicy::BestEffort,
            _ => StagePolicy::FailFast,
        }
    }

    /// Stages that turn a node into a cluster member; failures from here on
    /// leave state behind that rollback must clean up
    pub fn is_initialization(&self) -> bool {
        matches!(self, Stage::ControlPlaneInit | Stage::ClusterJoin)
    }

    /// Run the stage once against `node`
    pub async fn execute(
        &self,
        ctx: &RunContext,
        node: &NodeDescriptor,
        runner: &dyn CommandRunner,
    ) -> Result<(), StageError> {
        match self {
            Stage::Prerequisites => common::prerequisites(ctx, runner).await,
            Stage::ContainerRuntime => common::container_runtime(ctx, runner).await,
            Stage::KubernetesTooling => common::kubernetes_tooling(ctx, node, runner).await,
            Stage::SystemTuning => common::system_tuning(runner).await,
            Stage::ControlPlaneInit => control::init(ctx, node, runner).await,
            Stage::ApiServerReady => control::api_server_ready(ctx, runner).await,
            Stage::PodNetwork => control::pod_network(ctx, runner).await,
            Stage::JoinToken => control::join_token(ctx, runner).await,
            Stage::AuxiliaryTooling => control::auxiliary_tooling(ctx, runner).await,
            Stage::ClusterJoin => worker::join(ctx, node, runner).await,
            Stage::MonitoringAgent => worker::monitoring_agent(ctx, runner).await,
            Stage::NodeHealth => worker::node_health(ctx, runner).await,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure of a single stage attempt
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("timed out after {}s waiting for {condition}", .waited.as_secs())]
    Timeout {
        condition: String,
        waited: Duration,
        diagnostics: String,
    },

    #[error("join artifact {} is missing", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("{0}")]
    Interrupted(Interruption),

    #[error("{0}")]
    Tooling(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turn a wait outcome into a stage result, attaching diagnostics on timeout
pub(crate) async fn require_ready(
    outcome: WaitOutcome,
    condition: &str,
    runner: &dyn CommandRunner,
    diagnostics_cmd: &str,
) -> Result<(), StageError> {
    match outcome {
        WaitOutcome::Ready { .. } => Ok(()),
        WaitOutcome::Interrupted(reason) => Err(StageError::Interrupted(reason)),
        WaitOutcome::TimedOut { elapsed, .. } => {
            let diagnostics = crate::health::collect_diagnostics(runner, diagnostics_cmd).await;
            tracing::error!(
                condition = %condition,
                waited_secs = elapsed.as_secs(),
                "Readiness wait timed out, diagnostic snapshot follows\n{}",
                diagnostics.trim_end()
            );
            Err(StageError::Timeout {
                condition: condition.to_string(),
                waited: elapsed,
                diagnostics,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_pipeline_order() {
        let names: Vec<_> = control_plane_pipeline().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "prerequisites",
                "container-runtime",
                "kubernetes-tooling",
                "control-plane-init",
                "api-server-ready",
                "pod-network",
                "join-token",
                "auxiliary-tooling",
            ]
        );

        let names: Vec<_> = worker_pipeline().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "prerequisites",
                "container-runtime",
                "kubernetes-tooling",
                "system-tuning",
                "cluster-join",
                "monitoring-agent",
                "node-health",
            ]
        );
    }

    #[test]
    fn test_policies() {
        assert_eq!(Stage::Prerequisites.policy(), StagePolicy::FailFast);
        assert_eq!(Stage::ContainerRuntime.policy(), StagePolicy::Retry);
        assert_eq!(Stage::KubernetesTooling.policy(), StagePolicy::Retry);
        assert_eq!(Stage::ControlPlaneInit.policy(), StagePolicy::NonIdempotent);
        assert_eq!(Stage::ClusterJoin.policy(), StagePolicy::NonIdempotent);
        assert_eq!(Stage::AuxiliaryTooling.policy(), StagePolicy::BestEffort);
        assert_eq!(Stage::ApiServerReady.policy(), StagePolicy::FailFast);
    }

    #[test]
    fn test_one_initialization_stage_per_pipeline() {
        for pipeline in [control_plane_pipeline(), worker_pipeline()] {
            assert_eq!(pipeline.iter().filter(|s| s.is_initialization()).count(), 1);
            let unique: HashSet<_> = pipeline.iter().collect();
            assert_eq!(unique.len(), pipeline.len());
        }
    }

    #[test]
    fn test_stage_error_messages() {
        let err = StageError::ArtifactMissing(PathBuf::from("/shared/join.sh"));
        assert_eq!(err.to_string(), "join artifact /shared/join.sh is missing");

        let err = StageError::Timeout {
            condition: "pods k8s-app=kube-dns ready".to_string(),
            waited: Duration::from_secs(300),
            diagnostics: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 300s waiting for pods k8s-app=kube-dns ready"
        );
    }
}
