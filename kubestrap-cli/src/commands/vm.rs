//! VM lifecycle through the Vagrant provider

use crate::output;
use anyhow::Result;
use dialoguer::Confirm;
use kubestrap::provider::{VagrantProvider, VmProvider};
use kubestrap::{BootstrapError, KubestrapConfig};
use kubestrap_common::NodeDescriptor;

/// Stage name reported when a machine fails to come up
pub const VM_PROVISION_STAGE: &str = "vm-provision";

/// Bring up every planned machine, control plane first
pub async fn create_vms(config: &KubestrapConfig, nodes: &[NodeDescriptor]) -> Result<()> {
    let provider = VagrantProvider::new(&config.vagrant);
    for node in nodes {
        provider
            .up(node)
            .await
            .map_err(|e| BootstrapError::StageFailed {
                stage: VM_PROVISION_STAGE.to_string(),
                node: node.hostname.clone(),
                attempts: 1,
                message: e.to_string(),
            })?;
    }
    output::print_success(&format!("{} VMs are up", nodes.len()));
    Ok(())
}

pub async fn destroy(config: &KubestrapConfig, yes: bool) -> Result<()> {
    let provider = VagrantProvider::new(&config.vagrant);

    let machines = provider.status().await?;
    if machines.is_empty() {
        output::print_info("No VMs to destroy");
        return Ok(());
    }

    if !yes {
        let names: Vec<&str> = machines.iter().map(|m| m.name.as_str()).collect();
        let confirmed = Confirm::new()
            .with_prompt(format!("Destroy {}?", names.join(", ")))
            .default(false)
            .interact()?;
        if !confirmed {
            output::print_warning("Aborted");
            return Ok(());
        }
    }

    provider.destroy().await?;
    output::print_success(&format!("Destroyed {} VMs", machines.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestrap::error::exit_code;
    use kubestrap_common::{NodeResources, NodeRole};
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_failed_vm_up_is_stage_failure() {
        let mut config = KubestrapConfig::default();
        config.vagrant.binary = "/nonexistent/vagrant".to_string();
        config.vagrant.working_dir = PathBuf::from(".");
        let nodes = vec![NodeDescriptor {
            role: NodeRole::Control,
            hostname: "controlplane".to_string(),
            public_ip: "192.168.1.100".parse().unwrap(),
            private_ip: "172.16.0.10".parse().unwrap(),
            resources: NodeResources {
                cpus: 2,
                memory_mb: 4096,
            },
        }];

        let err = create_vms(&config, &nodes).await.unwrap_err();
        let bootstrap = err.downcast_ref::<BootstrapError>().unwrap();
        match bootstrap {
            BootstrapError::StageFailed { stage, node, .. } => {
                assert_eq!(stage, VM_PROVISION_STAGE);
                assert_eq!(node, "controlplane");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(bootstrap.exit_code(), exit_code::STAGE_FAILURE);
    }
}
