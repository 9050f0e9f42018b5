//! VM provider integration
//!
//! Machines are created and destroyed by an external hypervisor front-end. Only
//! Vagrant is supported; it is driven purely as a subprocess, one machine per
//! planned node (machine name == hostname).

use crate::config::VagrantConfig;
use async_trait::async_trait;
use kubestrap_common::{Error, NodeDescriptor, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{error, info};

/// Provider-reported state of one machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub name: String,
    pub state: String,
}

impl MachineStatus {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Create (or resume) the machine for a node without provisioning it
    async fn up(&self, node: &NodeDescriptor) -> Result<()>;

    /// Destroy every machine
    async fn destroy(&self) -> Result<()>;

    async fn status(&self) -> Result<Vec<MachineStatus>>;
}

/// Vagrant front-end
pub struct VagrantProvider {
    binary: String,
    working_dir: PathBuf,
}

impl VagrantProvider {
    pub fn new(config: &VagrantConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    async fn vagrant(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::System(format!("Failed to run {} {}: {}", self.binary, args.join(" "), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("vagrant {} failed: {}", args.join(" "), stderr.trim());
            return Err(Error::System(format!(
                "vagrant {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl VmProvider for VagrantProvider {
    async fn up(&self, node: &NodeDescriptor) -> Result<()> {
        info!(
            node = %node.hostname,
            cpus = node.resources.cpus,
            memory_mb = node.resources.memory_mb,
            "Creating VM"
        );
        self.vagrant(&["up", &node.hostname, "--no-provision"]).await?;
        info!(node = %node.hostname, "VM is up");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        info!("Destroying all VMs");
        self.vagrant(&["destroy", "-f"]).await?;
        Ok(())
    }

    async fn status(&self) -> Result<Vec<MachineStatus>> {
        let output = self.vagrant(&["status", "--machine-readable"]).await?;
        Ok(parse_machine_readable_status(&output))
    }
}

/// Parse `vagrant status --machine-readable`
/// (`timestamp,target,type,data...` per line; only `state` rows matter)
pub fn parse_machine_readable_status(output: &str) -> Vec<MachineStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(4, ',');
            let _timestamp = fields.next()?;
            let target = fields.next()?;
            let kind = fields.next()?;
            let data = fields.next()?;
            (kind == "state" && !target.is_empty()).then(|| MachineStatus {
                name: target.to_string(),
                state: data.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let output = "\
1718000000,,ui,info,Current machine states:
1718000000,controlplane,metadata,provider,virtualbox
1718000000,controlplane,provider-name,virtualbox
1718000000,controlplane,state,running
1718000000,controlplane,state-human-short,running
1718000000,node01,state,poweroff
1718000000,node02,state,not_created
";
        let machines = parse_machine_readable_status(output);
        assert_eq!(machines.len(), 3);
        assert_eq!(machines[0].name, "controlplane");
        assert!(machines[0].is_running());
        assert_eq!(machines[1].state, "poweroff");
        assert_eq!(machines[2].state, "not_created");
    }

    #[tokio::test]
    async fn test_missing_binary_is_system_error() {
        let provider = VagrantProvider::new(&VagrantConfig {
            binary: "/nonexistent/vagrant".to_string(),
            working_dir: PathBuf::from("."),
        });
        assert!(matches!(provider.destroy().await, Err(Error::System(_))));
    }
}
