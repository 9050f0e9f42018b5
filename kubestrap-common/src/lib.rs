//! Common types and utilities shared between kubestrap-core and kubestrap-cli

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Control,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "control" | "controlplane" | "control-plane" | "master" => Ok(Self::Control),
            "worker" | "node" => Ok(Self::Worker),
            other => Err(Error::Validation(format!("Unknown node role: {}", other))),
        }
    }
}

/// VM resource allocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeResources {
    pub cpus: u32,
    pub memory_mb: u64, // Memory in MB
}

/// One VM of the cluster, as planned from the settings file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub role: NodeRole,
    pub hostname: String,
    pub public_ip: Ipv4Addr,
    pub private_ip: Ipv4Addr,
    pub resources: NodeResources,
}

impl NodeDescriptor {
    pub fn is_control(&self) -> bool {
        self.role == NodeRole::Control
    }
}

/// Outcome of one provisioning stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    RetriedThenSuccess,
    Failed,
    /// A best-effort stage failed; the pipeline carried on
    BestEffortFailed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RetriedThenSuccess => write!(f, "retried-then-success"),
            Self::Failed => write!(f, "failed"),
            Self::BestEffortFailed => write!(f, "best-effort-failed"),
        }
    }
}

/// Record of one stage execution on one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub stage: String,
    pub node: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl StageResult {
    /// Build the result of a stage that eventually succeeded
    pub fn succeeded(
        stage: impl Into<String>,
        node: impl Into<String>,
        attempts: u32,
        elapsed_ms: u64,
    ) -> Self {
        let status = if attempts > 1 {
            StageStatus::RetriedThenSuccess
        } else {
            StageStatus::Success
        };

        Self {
            stage: stage.into(),
            node: node.into(),
            status,
            attempts,
            elapsed_ms,
        }
    }

    pub fn failed(
        stage: impl Into<String>,
        node: impl Into<String>,
        attempts: u32,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            node: node.into(),
            status: StageStatus::Failed,
            attempts,
            elapsed_ms,
        }
    }

    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            StageStatus::Success | StageStatus::RetriedThenSuccess
        )
    }
}

/// Summary of a whole orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub stages: Vec<StageResult>,
    pub success: bool,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started: Utc::now(),
            finished: None,
            stages: Vec::new(),
            success: false,
        }
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = StageResult>) {
        self.stages.extend(results);
    }

    pub fn finish(&mut self, success: bool) {
        self.finished = Some(Utc::now());
        self.success = success;
    }

    /// Stages executed on a given node, in order
    pub fn stages_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a StageResult> + 'a {
        self.stages.iter().filter(move |s| s.node == node)
    }
}

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_descriptor_serialization() {
        let node = NodeDescriptor {
            role: NodeRole::Worker,
            hostname: "node01".to_string(),
            public_ip: Ipv4Addr::new(192, 168, 1, 11),
            private_ip: Ipv4Addr::new(172, 16, 0, 21),
            resources: NodeResources {
                cpus: 1,
                memory_mb: 2048,
            },
        };

        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"role\":\"worker\""));
        assert!(json.contains("192.168.1.11"));

        let deserialized: NodeDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, node);
    }

    #[test]
    fn test_node_role_parsing() {
        assert_eq!("control".parse::<NodeRole>().unwrap(), NodeRole::Control);
        assert_eq!("master".parse::<NodeRole>().unwrap(), NodeRole::Control);
        assert_eq!("Worker".parse::<NodeRole>().unwrap(), NodeRole::Worker);
        assert!("etcd".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_stage_result_status_from_attempts() {
        let first = StageResult::succeeded("container-runtime", "node01", 1, 1200);
        assert_eq!(first.status, StageStatus::Success);

        let retried = StageResult::succeeded("container-runtime", "node01", 3, 21000);
        assert_eq!(retried.status, StageStatus::RetriedThenSuccess);
        assert!(retried.is_success());

        let failed = StageResult::failed("cluster-join", "node01", 1, 500);
        assert!(!failed.is_success());
    }

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::RetriedThenSuccess.to_string(), "retried-then-success");
        assert_eq!(StageStatus::BestEffortFailed.to_string(), "best-effort-failed");
    }

    #[test]
    fn test_run_report_filters_by_node() {
        let mut report = RunReport::new("run-1");
        report.extend(vec![
            StageResult::succeeded("prerequisites", "controlplane", 1, 10),
            StageResult::succeeded("prerequisites", "node01", 1, 10),
            StageResult::succeeded("cluster-join", "node01", 1, 10),
        ]);
        report.finish(true);

        assert_eq!(report.stages_for("node01").count(), 2);
        assert!(report.finished.is_some());
        assert!(report.success);
    }
}
