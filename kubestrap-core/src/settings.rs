//! Cluster settings loader
//!
//! Reads the declarative `settings.yaml` that describes node counts, network
//! ranges and software pins. The result is validated once and then shared
//! immutably by every pipeline.

use crate::network::{prefix_of, Ipv4Cidr};
use crate::provisioner;
use crate::validation;
use kubestrap_common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Environment variable that replaces `network.dns_servers`
pub const DNS_SERVERS_ENV: &str = "KUBESTRAP_DNS_SERVERS";

/// Whole-cluster description loaded from the settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    pub network: NetworkSettings,
    pub nodes: NodeSettings,
    pub software: SoftwareSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Public address of the control node; its first three octets are the public prefix
    pub control_ip: Ipv4Addr,
    /// Private address of the control node (defaults to `<private_prefix>.10`)
    #[serde(default)]
    pub control_private_ip: Option<Ipv4Addr>,
    /// Three-octet prefix of the private (cluster) network
    pub private_prefix: String,
    #[serde(deserialize_with = "dns_server_list")]
    pub dns_servers: Vec<String>,
    pub pod_cidr: String,
    pub service_cidr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub control: ControlSettings,
    pub workers: WorkerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    #[serde(default = "default_control_hostname")]
    pub hostname: String,
    pub cpu: u32,
    pub memory: u64,
}

/// One resource block applied uniformly to every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub count: u32,
    pub cpu: u32,
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwareSettings {
    #[serde(rename = "box", default = "default_box")]
    pub box_image: String,
    /// Distribution id used by the cri-o package repositories (e.g. xUbuntu_22.04)
    pub os: String,
    /// Kubernetes package stream, `vMAJOR.MINOR`
    pub kubernetes: String,
    /// cri-o package stream, `vMAJOR.MINOR`
    pub crio: String,
    pub calico: String,
    #[serde(default = "default_node_exporter")]
    pub node_exporter: String,
    #[serde(default = "default_argocd")]
    pub argocd: String,
    #[serde(default = "default_metrics_server")]
    pub metrics_server: String,
}

fn default_cluster_name() -> String {
    "kubestrap".to_string()
}

fn default_control_hostname() -> String {
    "controlplane".to_string()
}

fn default_box() -> String {
    "bento/ubuntu-22.04".to_string()
}

fn default_node_exporter() -> String {
    "1.8.2".to_string()
}

fn default_argocd() -> String {
    "stable".to_string()
}

fn default_metrics_server() -> String {
    "latest".to_string()
}

/// Accept either a YAML list or a comma-separated string
fn dns_server_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DnsServers {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match DnsServers::deserialize(deserializer)? {
        DnsServers::List(list) => list.into_iter().map(|s| s.trim().to_string()).collect(),
        DnsServers::Joined(joined) => joined
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    })
}

impl ClusterSpec {
    /// Load, apply environment overrides and validate a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("Failed to read settings file {:?}: {}", path, e))
        })?;

        let mut spec = Self::parse(&content)?;

        if let Ok(servers) = std::env::var(DNS_SERVERS_ENV) {
            spec.network.dns_servers = validation::parse_dns_servers(&servers)?;
        }

        spec.validate()?;
        tracing::info!(
            path = %path.display(),
            cluster = %spec.cluster_name,
            workers = spec.nodes.workers.count,
            "Loaded cluster settings"
        );

        Ok(spec)
    }

    /// Parse without validation
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse settings: {}", e)))
    }

    /// Parse and validate
    pub fn from_yaml(content: &str) -> Result<Self> {
        let spec = Self::parse(content)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_required("cluster_name", &self.cluster_name)?;

        let network = &self.network;
        validation::validate_dns_servers(&network.dns_servers)?;
        validation::validate_prefix("network.private_prefix", &network.private_prefix)?;
        let pods = self.pod_cidr()?;
        let services = self.service_cidr()?;
        if pods.overlaps(&services) {
            return Err(Error::Validation(format!(
                "network.pod_cidr {} overlaps network.service_cidr {}",
                pods, services
            )));
        }

        let nodes = &self.nodes;
        validation::validate_hostname(&nodes.control.hostname)?;
        validation::validate_cpus("nodes.control.cpu", nodes.control.cpu)?;
        validation::validate_memory("nodes.control.memory", nodes.control.memory)?;
        validation::validate_worker_count(nodes.workers.count)?;
        validation::validate_cpus("nodes.workers.cpu", nodes.workers.cpu)?;
        validation::validate_memory("nodes.workers.memory", nodes.workers.memory)?;

        let software = &self.software;
        validation::validate_required("software.os", &software.os)?;
        validation::validate_required("software.crio", &software.crio)?;
        validation::validate_required("software.calico", &software.calico)?;
        validation::validate_minor_version("software.kubernetes", &software.kubernetes)?;
        validation::validate_minor_version("software.crio", &software.crio)?;

        // Address plan: unique and outside the reserved ranges
        let plan = provisioner::plan_nodes(self)?;
        provisioner::verify_plan(self, &plan)?;

        Ok(())
    }

    pub fn pod_cidr(&self) -> Result<Ipv4Cidr> {
        self.network.pod_cidr.parse()
    }

    pub fn service_cidr(&self) -> Result<Ipv4Cidr> {
        self.network.service_cidr.parse()
    }

    /// First three octets of the control node's public address
    pub fn public_prefix(&self) -> String {
        prefix_of(self.network.control_ip)
    }

    pub fn worker_count(&self) -> u32 {
        self.nodes.workers.count
    }

    /// Version without the leading `v`, as used in package repository paths
    pub fn kubernetes_minor(&self) -> &str {
        self.software.kubernetes.trim_start_matches('v')
    }

    pub fn crio_minor(&self) -> &str {
        self.software.crio.trim_start_matches('v')
    }

    pub fn calico_version(&self) -> &str {
        self.software.calico.trim_start_matches('v')
    }
}
