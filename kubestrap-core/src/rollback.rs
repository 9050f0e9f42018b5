//! Node cleanup after a fatal stage failure
//!
//! Resets whatever a half-finished init or join left behind so the node can be
//! provisioned again. Every step is best-effort: failures are recorded on the
//! plan and logged, never returned.

use crate::runner::CommandRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Rollback action type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackAction {
    /// Undo kubeadm init/join
    ResetKubeadm,
    /// Flush iptables NAT and filter tables
    FlushIptables,
    /// Remove CNI config and virtual interfaces
    RemoveCni,
    /// Stop kubelet and the container runtime
    StopServices,
}

impl RollbackAction {
    pub fn script(&self) -> &'static str {
        match self {
            RollbackAction::ResetKubeadm => "sudo kubeadm reset -f",
            RollbackAction::FlushIptables => {
                "sudo iptables -t nat -F && sudo iptables -t nat -X && sudo iptables -F && sudo iptables -X"
            }
            RollbackAction::RemoveCni => {
                "sudo rm -rf /etc/cni/net.d; for link in cni0 tunl0 vxlan.calico; do sudo ip link delete \"$link\" 2>/dev/null || true; done"
            }
            RollbackAction::StopServices => "sudo systemctl stop kubelet crio",
        }
    }
}

/// Rollback step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    pub action: RollbackAction,
    pub description: String,
    pub executed: bool,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RollbackStep {
    pub fn new(action: RollbackAction, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
            executed: false,
            success: None,
            error: None,
            timestamp: None,
        }
    }

    pub fn mark_executed(&mut self, success: bool, error: Option<String>) {
        self.executed = true;
        self.success = Some(success);
        self.error = error;
        self.timestamp = Some(Utc::now());
    }
}

/// Rollback plan for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub node: String,
    pub failed_stage: String,
    pub steps: Vec<RollbackStep>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub success: bool,
}

impl RollbackPlan {
    pub fn new(node: impl Into<String>, failed_stage: impl Into<String>) -> Self {
        let steps = vec![
            RollbackStep::new(RollbackAction::ResetKubeadm, "Reset kubeadm state"),
            RollbackStep::new(RollbackAction::FlushIptables, "Flush iptables NAT/filter rules"),
            RollbackStep::new(RollbackAction::RemoveCni, "Remove CNI config and interfaces"),
            RollbackStep::new(RollbackAction::StopServices, "Stop kubelet and crio"),
        ];

        Self {
            node: node.into(),
            failed_stage: failed_stage.into(),
            steps,
            started: None,
            completed: None,
            success: false,
        }
    }

    /// Execute every step; never fails
    pub async fn execute(&mut self, runner: &dyn CommandRunner) {
        warn!(
            node = %self.node,
            stage = %self.failed_stage,
            "Starting rollback after fatal stage failure"
        );

        self.started = Some(Utc::now());

        for step in self.steps.iter_mut() {
            info!(node = %self.node, "Executing rollback step: {}", step.description);

            match runner.run(step.action.script()).await {
                Ok(_) => {
                    step.mark_executed(true, None);
                    info!(node = %self.node, "Rollback step completed: {}", step.description);
                }
                Err(e) => {
                    // Keep going; later steps do not depend on earlier ones
                    error!(node = %self.node, error = %e, "Rollback step failed: {}", step.description);
                    step.mark_executed(false, Some(e.to_string()));
                }
            }
        }

        self.completed = Some(Utc::now());
        self.success = self.steps.iter().all(|s| s.success == Some(true));

        if self.success {
            info!(node = %self.node, "Rollback completed");
        } else {
            let failed: Vec<_> = self.failed_steps().collect();
            warn!(
                node = %self.node,
                "Rollback partially failed. Failed steps: {:?}",
                failed
            );
        }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(|s| s.success == Some(false))
            .map(|s| s.description.as_str())
    }
}

/// Run a full rollback of `node` and return the executed plan
pub async fn cleanup_on_failure(
    node: &str,
    failed_stage: &str,
    runner: &dyn CommandRunner,
) -> RollbackPlan {
    let mut plan = RollbackPlan::new(node, failed_stage);
    plan.execute(runner).await;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandError, CommandOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        fail: bool,
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        fn target(&self) -> &str {
            "controlplane"
        }

        async fn exec(&self, script: &str) -> Result<CommandOutput, CommandError> {
            self.scripts.lock().unwrap().push(script.to_string());
            if self.fail {
                return Err(CommandError::Spawn {
                    target: "controlplane".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no route to host"),
                });
            }
            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_rollback_runs_every_step() {
        let runner = Recorder {
            fail: false,
            scripts: Mutex::new(Vec::new()),
        };
        let plan = cleanup_on_failure("controlplane", "control-plane-init", &runner).await;

        assert!(plan.success);
        assert!(plan.steps.iter().all(|s| s.executed));
        let scripts = runner.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 4);
        assert_eq!(scripts[0], "sudo kubeadm reset -f");
        assert!(scripts[1].contains("iptables -t nat -F"));
        assert!(scripts[2].contains("/etc/cni/net.d"));
    }

    #[tokio::test]
    async fn test_rollback_survives_every_step_failing() {
        let runner = Recorder {
            fail: true,
            scripts: Mutex::new(Vec::new()),
        };
        let plan = cleanup_on_failure("node01", "cluster-join", &runner).await;

        assert!(!plan.success);
        assert_eq!(plan.failed_steps().count(), 4);
        assert!(plan.completed.is_some());
        assert!(plan
            .steps
            .iter()
            .all(|s| s.error.as_deref().is_some_and(|e| e.contains("no route to host"))));
        // every step was still attempted
        assert_eq!(runner.scripts.lock().unwrap().len(), 4);
    }
}
