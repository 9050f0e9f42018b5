//! Worker stages

use super::{require_ready, StageError};
use crate::context::RunContext;
use crate::health::{self, await_condition, WaitPolicy};
use crate::runner::CommandRunner;
use kubestrap_common::NodeDescriptor;
use tracing::info;

/// Join command from the artifact, pinned to this node's hostname
pub fn join_script(artifact: &str, node: &NodeDescriptor) -> Option<String> {
    let command = artifact
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("kubeadm join"))?;

    Some(format!(
        "set -euo pipefail\nsudo {} --node-name {}",
        command, node.hostname
    ))
}

pub fn node_exporter_script(version: &str) -> String {
    let version = version.trim_start_matches('v');
    let archive = format!("node_exporter-{}.linux-amd64", version);
    format!(
        r#"set -euo pipefail
id node_exporter >/dev/null 2>&1 || sudo useradd --no-create-home --shell /bin/false node_exporter
cd /tmp
curl -fsSLO https://github.com/prometheus/node_exporter/releases/download/v{version}/{archive}.tar.gz
tar xzf {archive}.tar.gz
sudo install -m 0755 {archive}/node_exporter /usr/local/bin/node_exporter
rm -rf {archive} {archive}.tar.gz

cat <<EOF | sudo tee /etc/systemd/system/node_exporter.service
[Unit]
Description=Prometheus Node Exporter
Wants=network-online.target
After=network-online.target

[Service]
User=node_exporter
Group=node_exporter
Type=simple
ExecStart=/usr/local/bin/node_exporter
Restart=on-failure

[Install]
WantedBy=multi-user.target
EOF
sudo systemctl daemon-reload
sudo systemctl enable --now node_exporter
"#
    )
}

/// Join the cluster using the published artifact; never retried
pub(super) async fn join(
    ctx: &RunContext,
    node: &NodeDescriptor,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    let path = ctx.config.paths.join_script_path();

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(StageError::ArtifactMissing(path));
    }

    let artifact = tokio::fs::read_to_string(&path).await?;
    let script = join_script(&artifact, node).ok_or(StageError::ArtifactMissing(path))?;

    runner.run(&script).await?;
    info!(node = %node.hostname, "Joined cluster");
    Ok(())
}

pub(super) async fn monitoring_agent(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    runner
        .run(&node_exporter_script(&ctx.spec.software.node_exporter))
        .await?;
    Ok(())
}

pub(super) async fn node_health(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    let condition = "kubelet healthz";
    let outcome = await_condition(
        ctx,
        condition,
        WaitPolicy::node_health(&ctx.config.waits),
        || health::kubelet_healthy(runner),
    )
    .await;

    require_ready(
        outcome,
        condition,
        runner,
        "sudo systemctl status kubelet --no-pager; sudo journalctl -u kubelet -n 50 --no-pager",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::plan_nodes;
    use crate::settings::tests::sample_spec;

    #[test]
    fn test_join_script_uses_artifact_line() {
        let nodes = plan_nodes(&sample_spec()).unwrap();
        let artifact = "kubeadm join 172.16.0.10:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00ff \n";

        let script = join_script(artifact, &nodes[2]).unwrap();
        assert!(script.ends_with(
            "sudo kubeadm join 172.16.0.10:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00ff --node-name node02"
        ));
    }

    #[test]
    fn test_join_script_rejects_empty_artifact() {
        let nodes = plan_nodes(&sample_spec()).unwrap();
        assert!(join_script("", &nodes[1]).is_none());
        assert!(join_script("#!/bin/bash\n", &nodes[1]).is_none());
    }

    #[test]
    fn test_node_exporter_version() {
        let script = node_exporter_script("v1.8.2");
        assert!(script.contains("download/v1.8.2/node_exporter-1.8.2.linux-amd64.tar.gz"));
        assert!(script.contains("systemctl enable --now node_exporter"));
    }
}
