pub mod cluster;
pub mod node;
pub mod settings;
pub mod vm;

use crate::output;
use anyhow::{Context, Result};
use kubestrap::shutdown::ShutdownCoordinator;
use kubestrap::{ClusterSpec, KubestrapConfig, RunContext};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub fn load_spec(path: &Path) -> Result<ClusterSpec> {
    ClusterSpec::load(path).with_context(|| format!("Invalid settings file {}", path.display()))
}

/// Run context cancelled by SIGINT/SIGTERM
pub fn signal_context(spec: ClusterSpec, config: KubestrapConfig) -> RunContext {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let ctx = RunContext::new(Arc::new(spec), Arc::new(config), coordinator.subscribe());

    tokio::spawn(async move {
        if let Err(e) = coordinator.wait_for_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        output::print_warning("Interrupted, cancelling the run");
    });

    ctx
}
