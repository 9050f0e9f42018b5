//! Settings inspection commands

use super::load_spec;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use kubestrap::provisioner::plan_nodes;
use kubestrap_common::NodeDescriptor;
use std::path::Path;
use tabled::Tabled;

#[derive(Tabled)]
struct NodeRow {
    hostname: String,
    role: String,
    public_ip: String,
    private_ip: String,
    cpus: u32,
    memory_mb: u64,
}

impl From<&NodeDescriptor> for NodeRow {
    fn from(node: &NodeDescriptor) -> Self {
        Self {
            hostname: node.hostname.clone(),
            role: node.role.to_string(),
            public_ip: node.public_ip.to_string(),
            private_ip: node.private_ip.to_string(),
            cpus: node.resources.cpus,
            memory_mb: node.resources.memory_mb,
        }
    }
}

pub fn validate(path: &Path, format: OutputFormat) -> Result<()> {
    let spec = load_spec(path)?;
    // Planning catches address overflows the field checks cannot see
    plan_nodes(&spec)?;

    match format {
        OutputFormat::Json => output::print_json(&spec)?,
        OutputFormat::Yaml => output::print_yaml(&spec)?,
        OutputFormat::Table => {
            output::print_success(&format!("{} is valid", path.display()));
            println!("Cluster: {}", spec.cluster_name);
            println!("  Control:    {} ({})", spec.nodes.control.hostname, spec.network.control_ip);
            println!("  Workers:    {}", spec.worker_count());
            println!("  Private:    {}.0/24", spec.network.private_prefix);
            println!("  Pod CIDR:   {}", spec.network.pod_cidr);
            println!("  Svc CIDR:   {}", spec.network.service_cidr);
            println!("  DNS:        {}", spec.network.dns_servers.join(", "));
            println!("  Kubernetes: {}", spec.software.kubernetes);
            println!("  CRI-O:      {}", spec.software.crio);
            println!("  Calico:     {}", spec.software.calico);
        }
    }
    Ok(())
}

pub fn plan(path: &Path, format: OutputFormat) -> Result<()> {
    let spec = load_spec(path)?;
    let nodes = plan_nodes(&spec)?;

    let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
    output::print_output(rows, &nodes, format)
}
