//! kubectl invocation and output parsing
//!
//! Only the handful of fields readiness checks look at are modelled; unknown
//! fields in `kubectl get -o json` output are ignored.

use serde::Deserialize;

/// Admin kubeconfig written by `kubeadm init` on the control node
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Build a kubectl command line run as root against the admin kubeconfig
pub fn kubectl(args: &str) -> String {
    format!("sudo kubectl --kubeconfig={} {}", ADMIN_KUBECONFIG, args)
}

#[derive(Debug, Default, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Default, Deserialize)]
struct Object {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    status: Status,
}

impl Object {
    fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

/// Readiness tally for the pods matched by a selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodReadiness {
    pub matched: usize,
    pub ready: usize,
    /// Pods in phase `Succeeded` (finished jobs); matched but never Ready
    pub completed: usize,
    pub not_ready: Vec<String>,
}

impl PodReadiness {
    /// Ready only when at least one pod matched and every match is Ready
    pub fn is_ready(&self) -> bool {
        self.matched > 0 && self.ready == self.matched
    }

    /// Like [`is_ready`](Self::is_ready), but finished job pods count as done
    pub fn is_settled(&self) -> bool {
        self.matched > self.completed && self.ready + self.completed == self.matched
    }
}

impl std::fmt::Display for PodReadiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ready", self.ready, self.matched)?;
        if self.completed > 0 {
            write!(f, ", {} completed", self.completed)?;
        }
        Ok(())
    }
}

/// Parse `kubectl get pods -o json`
pub fn parse_pods(json: &str) -> Result<PodReadiness, serde_json::Error> {
    let list: ObjectList<Object> = serde_json::from_str(json)?;
    let mut readiness = PodReadiness {
        matched: list.items.len(),
        ..Default::default()
    };

    for pod in &list.items {
        if pod.is_ready() {
            readiness.ready += 1;
        } else if pod.status.phase.as_deref() == Some("Succeeded") {
            readiness.completed += 1;
        } else {
            readiness.not_ready.push(pod.metadata.name.clone());
        }
    }

    Ok(readiness)
}

/// Ready condition of a registered node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub name: String,
    pub ready: bool,
}

/// Parse `kubectl get nodes -o json`
pub fn parse_nodes(json: &str) -> Result<Vec<NodeState>, serde_json::Error> {
    let list: ObjectList<Object> = serde_json::from_str(json)?;
    Ok(list
        .items
        .iter()
        .map(|node| NodeState {
            name: node.metadata.name.clone(),
            ready: node.is_ready(),
        })
        .collect())
}
