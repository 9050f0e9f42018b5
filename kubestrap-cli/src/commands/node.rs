//! Single-node pipeline, run from inside the VM

use super::cluster::StageRow;
use super::{load_spec, signal_context};
use crate::output::{self, OutputFormat};
use anyhow::{bail, Result};
use kubestrap::provisioner::plan_nodes;
use kubestrap::runner::LocalConnector;
use kubestrap::{KubestrapConfig, Orchestrator};
use kubestrap_common::NodeRole;
use std::path::Path;
use std::sync::Arc;

pub async fn run(
    settings: &Path,
    config: KubestrapConfig,
    role: NodeRole,
    name: &str,
    format: OutputFormat,
) -> Result<()> {
    let spec = load_spec(settings)?;
    let nodes = plan_nodes(&spec)?;

    let Some(node) = nodes.into_iter().find(|n| n.hostname == name) else {
        bail!("{} is not part of the planned cluster", name);
    };
    if node.role != role {
        bail!("{} is a {} node, not {}", name, node.role, role);
    }

    let ctx = signal_context(spec, config);
    let outcome = Orchestrator::new(ctx, Arc::new(LocalConnector))
        .bootstrap(&node)
        .await;

    let rows: Vec<StageRow> = outcome.results.iter().map(StageRow::from).collect();
    output::print_output(rows, &outcome.results, format)?;

    if let Some(plan) = &outcome.rollback {
        output::print_warning(&format!(
            "Rolled back {} after {} failed",
            plan.node, plan.failed_stage
        ));
    }

    match outcome.error {
        Some(err) => Err(err.into()),
        None => {
            if format == OutputFormat::Table {
                output::print_success(&format!("{} bootstrapped", node.hostname));
            }
            Ok(())
        }
    }
}
