//! Control-plane stages

use super::{require_ready, StageError};
use crate::context::RunContext;
use crate::health::{self, await_condition, WaitPolicy};
use crate::kubectl::{kubectl, ADMIN_KUBECONFIG};
use crate::runner::CommandRunner;
use crate::settings::ClusterSpec;
use kubestrap_common::NodeDescriptor;
use std::path::Path;
use tracing::{info, warn};

/// Pod selectors that must be fully ready before the network counts as up
pub const NETWORK_SELECTORS: &[(&str, &str)] = &[
    ("kube-system", "k8s-app=kube-dns"),
    ("kube-system", "k8s-app=calico-node"),
];

pub fn init_script(spec: &ClusterSpec, node: &NodeDescriptor) -> String {
    format!(
        r#"set -euo pipefail
sudo kubeadm config images pull
sudo kubeadm init \
  --apiserver-advertise-address={private} \
  --apiserver-cert-extra-sans={public},{private} \
  --pod-network-cidr={pods} \
  --service-cidr={services} \
  --node-name {hostname} \
  --ignore-preflight-errors Swap
mkdir -p "$HOME/.kube"
sudo cp -f {admin} "$HOME/.kube/config"
sudo chown "$(id -u):$(id -g)" "$HOME/.kube/config"
"#,
        private = node.private_ip,
        public = node.public_ip,
        pods = spec.network.pod_cidr,
        services = spec.network.service_cidr,
        hostname = node.hostname,
        admin = ADMIN_KUBECONFIG,
    )
}

pub fn calico_manifest_url(spec: &ClusterSpec) -> String {
    format!(
        "https://raw.githubusercontent.com/projectcalico/calico/v{}/manifests/calico.yaml",
        spec.calico_version()
    )
}

/// Named install scripts for the best-effort tooling, in install order
pub fn aux_tooling_scripts(spec: &ClusterSpec) -> Vec<(&'static str, String)> {
    let software = &spec.software;

    let metrics_release = if software.metrics_server == "latest" {
        "latest/download".to_string()
    } else {
        format!("download/v{}", software.metrics_server.trim_start_matches('v'))
    };

    let argocd_ref = if software.argocd == "stable" {
        "stable".to_string()
    } else {
        format!("v{}", software.argocd.trim_start_matches('v'))
    };

    vec![
        (
            "helm",
            "set -euo pipefail\ncommand -v helm >/dev/null || curl -fsSL https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3 | bash".to_string(),
        ),
        (
            "metrics-server",
            kubectl(&format!(
                "apply -f https://github.com/kubernetes-sigs/metrics-server/releases/{}/components.yaml",
                metrics_release
            )),
        ),
        (
            "argocd",
            format!(
                "set -euo pipefail\n{} | {}\n{}",
                kubectl("create namespace argocd --dry-run=client -o yaml"),
                kubectl("apply -f -"),
                kubectl(&format!(
                    "apply -n argocd -f https://raw.githubusercontent.com/argoproj/argo-cd/{}/manifests/install.yaml",
                    argocd_ref
                )),
            ),
        ),
    ]
}

pub(super) async fn init(
    ctx: &RunContext,
    node: &NodeDescriptor,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    runner.run(&init_script(&ctx.spec, node)).await?;
    info!(node = %node.hostname, "Control plane initialized");
    Ok(())
}

pub(super) async fn api_server_ready(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    let condition = "API server /readyz";
    let outcome = await_condition(
        ctx,
        condition,
        WaitPolicy::api_server(&ctx.config.waits),
        || health::api_server_ready(runner),
    )
    .await;

    require_ready(outcome, condition, runner, "sudo crictl ps -a").await
}

pub(super) async fn pod_network(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    runner
        .run(&kubectl(&format!("apply -f {}", calico_manifest_url(&ctx.spec))))
        .await?;

    let diagnostics = kubectl("get pods -A -o wide");
    for (namespace, selector) in NETWORK_SELECTORS {
        let condition = format!("pods {} ready in {}", selector, namespace);
        let outcome = await_condition(ctx, &condition, WaitPolicy::pods(&ctx.config.waits), || {
            health::pods_ready(runner, namespace, selector)
        })
        .await;
        require_ready(outcome, &condition, runner, &diagnostics).await?;
    }

    Ok(())
}

/// Generate the worker join command and publish it with the admin kubeconfig
pub(super) async fn join_token(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    let join_command = runner
        .run("sudo kubeadm token create --print-join-command")
        .await?;
    let join_command = join_command.trim();
    if !join_command.starts_with("kubeadm join") {
        return Err(StageError::Tooling(format!(
            "unexpected join command output: {}",
            join_command
        )));
    }

    let paths = &ctx.config.paths;
    let join_path = paths.join_script_path();
    write_artifact(&join_path, &format!("{}\n", join_command), 0o755).await?;
    info!(path = %join_path.display(), "Join artifact written");

    let kubeconfig = runner.run(&format!("sudo cat {}", ADMIN_KUBECONFIG)).await?;
    let kubeconfig_path = paths.kubeconfig_path();
    write_artifact(&kubeconfig_path, &kubeconfig, 0o600).await?;
    info!(path = %kubeconfig_path.display(), "Admin kubeconfig copied");

    Ok(())
}

/// Install every auxiliary tool, continuing past failures
pub(super) async fn auxiliary_tooling(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    let mut failed = Vec::new();

    for (tool, script) in aux_tooling_scripts(&ctx.spec) {
        if let Some(reason) = ctx.interruption() {
            return Err(StageError::Interrupted(reason));
        }
        match runner.run(&script).await {
            Ok(_) => info!(tool, "Installed"),
            Err(e) => {
                warn!(tool, error = %e, "Install failed, continuing");
                failed.push(tool);
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(StageError::Tooling(format!(
            "failed to install {}",
            failed.join(", ")
        )))
    }
}

/// Write a shared artifact, creating its parent directory first
async fn write_artifact(path: &Path, contents: &str, mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    set_mode(path, mode).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
