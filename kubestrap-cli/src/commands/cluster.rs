//! Whole-cluster commands: bootstrap and verification

use super::{load_spec, signal_context, vm};
use crate::output::{self, OutputFormat};
use anyhow::Result;
use kubestrap::error::ErrorReport;
use kubestrap::provisioner::plan_nodes;
use kubestrap::rollback::RollbackPlan;
use kubestrap::runner::SshConnector;
use kubestrap::validator::ValidationReport;
use kubestrap::{KubestrapConfig, Orchestrator, RunOutcome};
use kubestrap_common::{RunReport, StageResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tabled::Tabled;

#[derive(Tabled)]
pub struct StageRow {
    node: String,
    stage: String,
    status: String,
    attempts: u32,
    elapsed: String,
}

impl From<&StageResult> for StageRow {
    fn from(result: &StageResult) -> Self {
        Self {
            node: result.node.clone(),
            stage: result.stage.clone(),
            status: output::format_status(result.status),
            attempts: result.attempts,
            elapsed: output::format_elapsed(result.elapsed_ms),
        }
    }
}

#[derive(Tabled)]
struct CheckRow {
    check: String,
    result: String,
    message: String,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    report: &'a RunReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<&'a ValidationReport>,
    rollbacks: &'a [RollbackPlan],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

pub async fn up(
    settings: &Path,
    config: KubestrapConfig,
    skip_vms: bool,
    format: OutputFormat,
) -> Result<()> {
    let spec = load_spec(settings)?;
    let nodes = plan_nodes(&spec)?;

    if skip_vms {
        output::print_info("Skipping VM creation");
    } else {
        vm::create_vms(&config, &nodes).await?;
    }

    let connector = Arc::new(SshConnector::new(config.ssh.clone()));
    let kubeconfig = config.paths.kubeconfig_path();
    let ctx = signal_context(spec, config);
    output::print_info(&format!("Run {}", ctx.run_id));

    let outcome = Orchestrator::new(ctx, connector).run().await;
    let succeeded = outcome.error.is_none();
    report_outcome(outcome, format)?;

    if succeeded && format == OutputFormat::Table {
        output::print_success("Cluster is up");
        output::print_info(&format!("Admin kubeconfig: {}", kubeconfig.display()));
    }
    Ok(())
}

pub async fn verify(settings: &Path, config: KubestrapConfig, format: OutputFormat) -> Result<()> {
    let spec = load_spec(settings)?;
    let connector = Arc::new(SshConnector::new(config.ssh.clone()));
    let ctx = signal_context(spec, config);

    let outcome = Orchestrator::new(ctx, connector).verify().await;
    let succeeded = outcome.error.is_none();
    report_outcome(outcome, format)?;

    if succeeded && format == OutputFormat::Table {
        output::print_success("Cluster is healthy");
    }
    Ok(())
}

/// Print the run and hand its error back for the exit code
pub fn report_outcome(outcome: RunOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => {
            let summary = RunSummary {
                report: &outcome.report,
                validation: outcome.validation.as_ref(),
                rollbacks: &outcome.rollbacks,
                error: outcome.error.as_ref().map(|e| e.to_error_report()),
            };
            if format == OutputFormat::Json {
                output::print_json(&summary)?;
            } else {
                output::print_yaml(&summary)?;
            }
        }
        OutputFormat::Table => print_tables(&outcome),
    }

    match outcome.into_result() {
        Ok(_) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn print_tables(outcome: &RunOutcome) {
    let rows: Vec<StageRow> = outcome.report.stages.iter().map(StageRow::from).collect();
    output::print_table(rows);

    if let Some(validation) = &outcome.validation {
        let rows: Vec<CheckRow> = validation
            .checks
            .iter()
            .map(|c| CheckRow {
                check: c.name.clone(),
                result: if c.passed { "pass" } else { "FAIL" }.to_string(),
                message: c.message.clone(),
            })
            .collect();
        output::print_table(rows);
    }

    for plan in &outcome.rollbacks {
        let failed: Vec<&str> = plan.failed_steps().collect();
        if failed.is_empty() {
            output::print_warning(&format!(
                "Rolled back {} after {} failed",
                plan.node, plan.failed_stage
            ));
        } else {
            output::print_warning(&format!(
                "Rollback of {} incomplete, failed steps: {}",
                plan.node,
                failed.join(", ")
            ));
        }
    }

    if let Some(err) = &outcome.error {
        let report = err.to_error_report();
        if let Some(diagnostics) = report.diagnostics {
            eprintln!("--- diagnostics ---");
            eprintln!("{}", diagnostics.trim_end());
        }
    }
}
