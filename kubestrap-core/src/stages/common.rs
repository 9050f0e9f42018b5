//! Stages shared by control and worker nodes

use super::StageError;
use crate::context::RunContext;
use crate::runner::CommandRunner;
use crate::settings::ClusterSpec;
use kubestrap_common::NodeDescriptor;

/// Swap off, kernel modules, bridge sysctls and DNS resolvers
pub fn prerequisites_script(spec: &ClusterSpec) -> String {
    format!(
        r#"set -euo pipefail
sudo swapoff -a
(crontab -l 2>/dev/null | grep -v swapoff; echo "@reboot /sbin/swapoff -a") | crontab - || true

cat <<EOF | sudo tee /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF
sudo modprobe overlay
sudo modprobe br_netfilter

cat <<EOF | sudo tee /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sudo sysctl --system

sudo mkdir -p /etc/systemd/resolved.conf.d
cat <<EOF | sudo tee /etc/systemd/resolved.conf.d/dns_servers.conf
[Resolve]
DNS={dns}
EOF
sudo systemctl restart systemd-resolved
"#,
        dns = spec.network.dns_servers.join(" ")
    )
}

/// cri-o from the libcontainers repositories for the configured OS id
pub fn container_runtime_script(spec: &ClusterSpec) -> String {
    let os = &spec.software.os;
    let crio = spec.crio_minor();
    let base = "https://download.opensuse.org/repositories/devel:/kubic:/libcontainers:/stable";

    format!(
        r#"set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
sudo apt-get update -y
sudo apt-get install -y software-properties-common curl apt-transport-https ca-certificates gpg

echo "deb [signed-by=/usr/share/keyrings/libcontainers-archive-keyring.gpg] {base}/{os}/ /" \
  | sudo tee /etc/apt/sources.list.d/devel:kubic:libcontainers:stable.list
echo "deb [signed-by=/usr/share/keyrings/libcontainers-crio-archive-keyring.gpg] {base}:/cri-o:/{crio}/{os}/ /" \
  | sudo tee /etc/apt/sources.list.d/devel:kubic:libcontainers:stable:cri-o:{crio}.list

curl -fsSL {base}:/cri-o:/{crio}/{os}/Release.key \
  | sudo gpg --dearmor --yes -o /usr/share/keyrings/libcontainers-crio-archive-keyring.gpg
curl -fsSL {base}/{os}/Release.key \
  | sudo gpg --dearmor --yes -o /usr/share/keyrings/libcontainers-archive-keyring.gpg

sudo apt-get update -y
sudo apt-get install -y cri-o cri-o-runc
sudo systemctl daemon-reload
sudo systemctl enable crio --now
"#
    )
}

/// kubelet, kubeadm and kubectl pinned to the configured minor stream
pub fn kubernetes_tooling_script(spec: &ClusterSpec, node: &NodeDescriptor) -> String {
    let minor = spec.kubernetes_minor();
    format!(
        r#"set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
sudo mkdir -p -m 755 /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{minor}/deb/Release.key \
  | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{minor}/deb/ /" \
  | sudo tee /etc/apt/sources.list.d/kubernetes.list

sudo apt-get update -y
sudo apt-get install -y kubelet kubectl kubeadm jq
sudo apt-mark hold kubelet kubeadm kubectl

cat <<EOF | sudo tee /etc/default/kubelet
KUBELET_EXTRA_ARGS=--node-ip={node_ip}
EOF
sudo systemctl enable kubelet
"#,
        node_ip = node.private_ip
    )
}

/// Kernel and ulimit tuning for worker workloads
pub fn system_tuning_script() -> &'static str {
    r#"set -euo pipefail
cat <<EOF | sudo tee /etc/sysctl.d/90-kubestrap-worker.conf
vm.max_map_count = 262144
fs.inotify.max_user_watches = 524288
fs.inotify.max_user_instances = 512
net.core.somaxconn = 32768
net.ipv4.tcp_max_syn_backlog = 8192
EOF
sudo sysctl --system

cat <<EOF | sudo tee /etc/security/limits.d/90-kubestrap.conf
* soft nofile 1048576
* hard nofile 1048576
* soft nproc  65536
* hard nproc  65536
EOF
"#
}

pub(super) async fn prerequisites(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    runner.run(&prerequisites_script(&ctx.spec)).await?;
    Ok(())
}

pub(super) async fn container_runtime(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    runner.run(&container_runtime_script(&ctx.spec)).await?;
    Ok(())
}

pub(super) async fn kubernetes_tooling(
    ctx: &RunContext,
    node: &NodeDescriptor,
    runner: &dyn CommandRunner,
) -> Result<(), StageError> {
    runner
        .run(&kubernetes_tooling_script(&ctx.spec, node))
        .await?;
    Ok(())
}

pub(super) async fn system_tuning(runner: &dyn CommandRunner) -> Result<(), StageError> {
    runner.run(system_tuning_script()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::plan_nodes;
    use crate::settings::tests::sample_spec;

    #[test]
    fn test_prerequisites_configure_dns() {
        let script = prerequisites_script(&sample_spec());
        assert!(script.contains("DNS=8.8.8.8 1.1.1.1"));
        assert!(script.contains("sudo swapoff -a"));
        assert!(script.contains("br_netfilter"));
    }

    #[test]
    fn test_runtime_uses_pinned_stream() {
        let script = container_runtime_script(&sample_spec());
        assert!(script.contains("cri-o:/1.30/xUbuntu_22.04/"));
        assert!(script.contains("apt-get install -y cri-o cri-o-runc"));
    }

    #[test]
    fn test_tooling_sets_node_ip() {
        let spec = sample_spec();
        let nodes = plan_nodes(&spec).unwrap();
        let script = kubernetes_tooling_script(&spec, &nodes[1]);
        assert!(script.contains("pkgs.k8s.io/core:/stable:/v1.30/deb/"));
        assert!(script.contains("KUBELET_EXTRA_ARGS=--node-ip=172.16.0.21"));
    }
}
