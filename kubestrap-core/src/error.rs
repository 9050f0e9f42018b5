//! Bootstrap failure taxonomy
//!
//! Every fatal outcome of a run is a [`BootstrapError`], which knows its
//! process exit code and renders to an [`ErrorReport`] for machine-readable
//! output.

use crate::config::ConfigError;
use crate::context::Interruption;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Process exit codes
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const CONFIGURATION: u8 = 1;
    pub const STAGE_FAILURE: u8 = 2;
    pub const TIMEOUT: u8 = 3;
    pub const CANCELLED: u8 = 130;
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Missing or malformed settings/config; nothing has been provisioned
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A stage failed, after exhausting retries where the stage allows them
    #[error("stage {stage} failed on {node} after {attempts} attempt(s): {message}")]
    StageFailed {
        stage: String,
        node: String,
        attempts: u32,
        message: String,
    },

    /// Init or join failed; never retried
    #[error("non-idempotent stage {stage} failed on {node}: {message}")]
    NonIdempotentFailure {
        stage: String,
        node: String,
        message: String,
    },

    #[error("stage {stage} on {node} timed out after {}s waiting for {condition}", .waited.as_secs())]
    ReadinessTimeout {
        stage: String,
        node: String,
        condition: String,
        waited: Duration,
        diagnostics: String,
    },

    #[error("join artifact {} is missing; {node} cannot join", .path.display())]
    JoinArtifactMissing { node: String, path: PathBuf },

    #[error("run cancelled during stage {stage} on {node}")]
    Cancelled { stage: String, node: String },

    #[error("run deadline exceeded during stage {stage} on {node}")]
    DeadlineExceeded { stage: String, node: String },
}

impl BootstrapError {
    pub fn exit_code(&self) -> u8 {
        match self {
            BootstrapError::Configuration(_) => exit_code::CONFIGURATION,
            BootstrapError::StageFailed { .. }
            | BootstrapError::NonIdempotentFailure { .. }
            | BootstrapError::JoinArtifactMissing { .. } => exit_code::STAGE_FAILURE,
            BootstrapError::ReadinessTimeout { .. } | BootstrapError::DeadlineExceeded { .. } => {
                exit_code::TIMEOUT
            }
            BootstrapError::Cancelled { .. } => exit_code::CANCELLED,
        }
    }

    /// Stable identifier for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            BootstrapError::Configuration(_) => "CONFIGURATION_ERROR",
            BootstrapError::StageFailed { .. } => "STAGE_FAILED",
            BootstrapError::NonIdempotentFailure { .. } => "NON_IDEMPOTENT_FAILURE",
            BootstrapError::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            BootstrapError::JoinArtifactMissing { .. } => "JOIN_ARTIFACT_MISSING",
            BootstrapError::Cancelled { .. } => "CANCELLED",
            BootstrapError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
        }
    }

    /// Stage the failure originated in, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            BootstrapError::Configuration(_) => None,
            BootstrapError::JoinArtifactMissing { .. } => Some("cluster-join"),
            BootstrapError::StageFailed { stage, .. }
            | BootstrapError::NonIdempotentFailure { stage, .. }
            | BootstrapError::ReadinessTimeout { stage, .. }
            | BootstrapError::Cancelled { stage, .. }
            | BootstrapError::DeadlineExceeded { stage, .. } => Some(stage),
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            BootstrapError::Configuration(_) => None,
            BootstrapError::StageFailed { node, .. }
            | BootstrapError::NonIdempotentFailure { node, .. }
            | BootstrapError::ReadinessTimeout { node, .. }
            | BootstrapError::JoinArtifactMissing { node, .. }
            | BootstrapError::Cancelled { node, .. }
            | BootstrapError::DeadlineExceeded { node, .. } => Some(node),
        }
    }

    pub fn interrupted(reason: Interruption, stage: &str, node: &str) -> Self {
        let (stage, node) = (stage.to_string(), node.to_string());
        match reason {
            Interruption::Cancelled => BootstrapError::Cancelled { stage, node },
            Interruption::DeadlineExceeded => BootstrapError::DeadlineExceeded { stage, node },
        }
    }

    pub fn to_error_report(&self) -> ErrorReport {
        let mut report = ErrorReport::new(self.exit_code(), self.code(), self.to_string());
        report.stage = self.stage().map(String::from);
        report.node = self.node().map(String::from);
        if let BootstrapError::ReadinessTimeout { diagnostics, .. } = self {
            report.diagnostics = Some(diagnostics.clone());
        }
        report
    }
}

impl From<kubestrap_common::Error> for BootstrapError {
    fn from(err: kubestrap_common::Error) -> Self {
        BootstrapError::Configuration(err.to_string())
    }
}

impl From<ConfigError> for BootstrapError {
    fn from(err: ConfigError) -> Self {
        BootstrapError::Configuration(err.to_string())
    }
}

/// Machine-readable failure summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub exit_code: u8,

    /// Error code for programmatic handling
    pub error: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Diagnostic snapshot captured before the failure propagated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,

    /// Timestamp when error occurred
    pub timestamp: String,
}

impl ErrorReport {
    pub fn new(exit_code: u8, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            error: error.into(),
            message: message.into(),
            stage: None,
            node: None,
            diagnostics: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
