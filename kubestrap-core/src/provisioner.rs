//! Node provisioner
//!
//! Turns a [`ClusterSpec`] into the ordered list of node descriptors. Pure and
//! deterministic: the same settings always yield the same hostnames and addresses.

use crate::network::address_in_prefix;
use crate::settings::ClusterSpec;
use kubestrap_common::{Error, NodeDescriptor, NodeResources, NodeRole, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

/// Worker `i` (1-indexed) gets public host octet `i + 10`
pub const WORKER_PUBLIC_OFFSET: u32 = 10;
/// Worker `i` (1-indexed) gets private host octet `i + 20`
pub const WORKER_PRIVATE_OFFSET: u32 = 20;
/// Default private host octet for the control node
pub const CONTROL_PRIVATE_HOST: u32 = 10;

/// Hostname of the `index`-th worker (1-indexed)
pub fn worker_hostname(index: u32) -> String {
    format!("node{:02}", index)
}

/// Plan the control node followed by every worker, in provisioning order
pub fn plan_nodes(spec: &ClusterSpec) -> Result<Vec<NodeDescriptor>> {
    let network = &spec.network;
    let public_prefix = spec.public_prefix();

    let control_private = match network.control_private_ip {
        Some(ip) => ip,
        None => address_in_prefix(&network.private_prefix, CONTROL_PRIVATE_HOST)?,
    };

    let mut nodes = Vec::new();
    nodes.push(NodeDescriptor {
        role: NodeRole::Control,
        hostname: spec.nodes.control.hostname.clone(),
        public_ip: network.control_ip,
        private_ip: control_private,
        resources: NodeResources {
            cpus: spec.nodes.control.cpu,
            memory_mb: spec.nodes.control.memory,
        },
    });

    let worker_resources = NodeResources {
        cpus: spec.nodes.workers.cpu,
        memory_mb: spec.nodes.workers.memory,
    };

    for index in 1..=spec.worker_count() {
        nodes.push(NodeDescriptor {
            role: NodeRole::Worker,
            hostname: worker_hostname(index),
            public_ip: address_in_prefix(&public_prefix, index + WORKER_PUBLIC_OFFSET)?,
            private_ip: address_in_prefix(&network.private_prefix, index + WORKER_PRIVATE_OFFSET)?,
            resources: worker_resources,
        });
    }

    Ok(nodes)
}

/// Check that every planned address and hostname is unique and that no node
/// address falls inside the pod or service ranges.
pub fn verify_plan(spec: &ClusterSpec, nodes: &[NodeDescriptor]) -> Result<()> {
    let pods = spec.pod_cidr()?;
    let services = spec.service_cidr()?;

    let mut owners: HashMap<Ipv4Addr, &str> = HashMap::new();
    let mut hostnames: HashSet<&str> = HashSet::new();

    for node in nodes {
        if !hostnames.insert(node.hostname.as_str()) {
            return Err(Error::Validation(format!(
                "Hostname {} is assigned to more than one node",
                node.hostname
            )));
        }

        for ip in [node.public_ip, node.private_ip] {
            if let Some(owner) = owners.insert(ip, node.hostname.as_str()) {
                return Err(Error::Validation(format!(
                    "Address {} is assigned to both {} and {}",
                    ip, owner, node.hostname
                )));
            }

            if pods.contains(ip) || services.contains(ip) {
                return Err(Error::Validation(format!(
                    "Address {} of {} falls inside a reserved range (pods {}, services {})",
                    ip, node.hostname, pods, services
                )));
            }
        }
    }

    Ok(())
}

/// The single control node of a plan
pub fn control_node(nodes: &[NodeDescriptor]) -> Result<&NodeDescriptor> {
    nodes
        .iter()
        .find(|n| n.is_control())
        .ok_or_else(|| Error::InvalidConfig("Plan has no control node".to_string()))
}

pub fn worker_nodes(nodes: &[NodeDescriptor]) -> impl Iterator<Item = &NodeDescriptor> {
    nodes.iter().filter(|n| n.role == NodeRole::Worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::tests::{sample_spec, SAMPLE};

    #[test]
    fn test_plan_matches_documented_layout() {
        let nodes = plan_nodes(&sample_spec()).unwrap();
        assert_eq!(nodes.len(), 3);

        assert_eq!(nodes[0].role, NodeRole::Control);
        assert_eq!(nodes[0].public_ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(nodes[0].private_ip, Ipv4Addr::new(172, 16, 0, 10));

        assert_eq!(nodes[1].hostname, "node01");
        assert_eq!(nodes[1].public_ip, Ipv4Addr::new(192, 168, 1, 11));
        assert_eq!(nodes[1].private_ip, Ipv4Addr::new(172, 16, 0, 21));

        assert_eq!(nodes[2].hostname, "node02");
        assert_eq!(nodes[2].public_ip, Ipv4Addr::new(192, 168, 1, 12));
        assert_eq!(nodes[2].private_ip, Ipv4Addr::new(172, 16, 0, 22));
    }

    #[test]
    fn test_worker_resources_are_uniform() {
        let nodes = plan_nodes(&sample_spec()).unwrap();
        let workers: Vec<_> = worker_nodes(&nodes).collect();
        assert!(workers.iter().all(|w| w.resources.cpus == 1 && w.resources.memory_mb == 2048));
        assert_eq!(control_node(&nodes).unwrap().resources.cpus, 2);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let spec = sample_spec();
        assert_eq!(plan_nodes(&spec).unwrap(), plan_nodes(&spec).unwrap());
    }

    #[test]
    fn test_addresses_pairwise_distinct_for_all_counts() {
        let mut spec = sample_spec();
        for count in 0..=60 {
            spec.nodes.workers.count = count;
            let nodes = plan_nodes(&spec).unwrap();
            verify_plan(&spec, &nodes).unwrap();

            let mut seen = HashSet::new();
            for node in &nodes {
                assert!(seen.insert(node.public_ip));
                assert!(seen.insert(node.private_ip));
            }

            for (i, worker) in worker_nodes(&nodes).enumerate() {
                let i = i as u8 + 1;
                assert_eq!(worker.public_ip.octets()[3], i + 10);
                assert_eq!(worker.private_ip.octets()[3], i + 20);
            }
        }
    }

    #[test]
    fn test_shared_prefix_collision_is_rejected() {
        let yaml = SAMPLE
            .replace("private_prefix: 172.16.0", "private_prefix: 192.168.1")
            .replace("count: 2", "count: 11");
        let spec = ClusterSpec::parse(&yaml).unwrap();
        let nodes = plan_nodes(&spec).unwrap();

        // worker 11 public .21 collides with worker 1 private .21
        let err = verify_plan(&spec, &nodes).unwrap_err();
        assert!(err.to_string().contains("192.168.1.21"));
    }

    #[test]
    fn test_too_many_workers_for_prefix() {
        let mut spec = sample_spec();
        spec.nodes.workers.count = 240;
        assert!(plan_nodes(&spec).is_err());

        // Unvalidated counts fail on the first unusable address
        spec.nodes.workers.count = u32::MAX;
        assert!(plan_nodes(&spec).is_err());
    }
}
