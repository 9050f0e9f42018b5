//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use kubestrap::config::KubestrapConfig;
use kubestrap::provisioner::plan_nodes;
use kubestrap::runner::{CommandError, CommandOutput, CommandRunner, Connector};
use kubestrap::ClusterSpec;
use kubestrap_common::NodeDescriptor;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SETTINGS: &str = r#"
cluster_name: lab
network:
  control_ip: 192.168.1.100
  private_prefix: 172.16.0
  dns_servers: 8.8.8.8,1.1.1.1
  pod_cidr: 10.244.0.0/16
  service_cidr: 10.96.0.0/12
nodes:
  control:
    cpu: 2
    memory: 4096
  workers:
    count: 2
    cpu: 1
    memory: 2048
software:
  box: bento/ubuntu-22.04
  os: xUbuntu_22.04
  kubernetes: v1.30
  crio: v1.30
  calico: 3.26.1
"#;

pub const JOIN_COMMAND: &str =
    "kubeadm join 172.16.0.10:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:0a1b2c";

pub fn spec() -> ClusterSpec {
    ClusterSpec::from_yaml(SETTINGS).expect("sample settings are valid")
}

pub fn nodes() -> Vec<NodeDescriptor> {
    plan_nodes(&spec()).expect("sample plan")
}

/// Default orchestrator config with artifacts under `shared_dir`
pub fn config(shared_dir: &Path) -> KubestrapConfig {
    let mut config = KubestrapConfig::default();
    config.paths.shared_dir = shared_dir.to_path_buf();
    config
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: 100,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

pub fn pods_json(total: usize, ready: usize) -> String {
    let items: Vec<String> = (0..total)
        .map(|i| {
            format!(
                r#"{{"metadata":{{"name":"pod-{}"}},"status":{{"phase":"Running","conditions":[{{"type":"Ready","status":"{}"}}]}}}}"#,
                i,
                if i < ready { "True" } else { "False" }
            )
        })
        .collect();
    format!(r#"{{"kind":"List","items":[{}]}}"#, items.join(","))
}

pub fn nodes_json(nodes: &[(&str, bool)]) -> String {
    let items: Vec<String> = nodes
        .iter()
        .map(|(name, ready)| {
            format!(
                r#"{{"metadata":{{"name":"{}"}},"status":{{"conditions":[{{"type":"Ready","status":"{}"}}]}}}}"#,
                name,
                if *ready { "True" } else { "False" }
            )
        })
        .collect();
    format!(r#"{{"kind":"List","items":[{}]}}"#, items.join(","))
}

struct Rule {
    needle: String,
    queue: VecDeque<CommandOutput>,
    fallback: CommandOutput,
    hang: bool,
}

/// Fake runner answering scripts by substring match. Queued responses are
/// consumed first; the last-registered fallback answers afterwards.
pub struct ScriptedRunner {
    name: String,
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Runner answering every probe of a healthy cluster
    pub fn healthy(name: &str) -> Self {
        let runner = Self::new(name);
        runner.on("get --raw=/readyz", ok("ok"));
        runner.on("get pods", ok(&pods_json(3, 3)));
        runner.on("get pods -A -o wide", ok("NAMESPACE NAME READY STATUS"));
        runner.on(
            "get nodes -o json",
            ok(&nodes_json(&[
                ("controlplane", true),
                ("node01", true),
                ("node02", true),
            ])),
        );
        runner.on("kubeadm token create", ok(&format!("{}\n", JOIN_COMMAND)));
        runner.on("sudo cat /etc/kubernetes/admin.conf", ok("apiVersion: v1\nkind: Config\n"));
        runner.on("10248/healthz", ok("200"));
        runner
    }

    /// Answer scripts containing `needle` with `output`. Later rules take
    /// precedence; a rule for the same needle is replaced.
    pub fn on(&self, needle: &str, output: CommandOutput) {
        let mut rules = self.rules.lock().unwrap();
        rules.retain(|r| r.needle != needle);
        rules.insert(
            0,
            Rule {
                needle: needle.to_string(),
                queue: VecDeque::new(),
                fallback: output,
                hang: false,
            },
        );
    }

    /// Answer the next matching scripts with `sequence`, then `fallback`
    pub fn on_sequence(&self, needle: &str, sequence: Vec<CommandOutput>, fallback: CommandOutput) {
        let mut rules = self.rules.lock().unwrap();
        rules.retain(|r| r.needle != needle);
        rules.insert(
            0,
            Rule {
                needle: needle.to_string(),
                queue: sequence.into(),
                fallback,
                hang: false,
            },
        );
    }

    /// Scripts containing `needle` never complete, like a stuck apt lock or ssh session
    pub fn hang(&self, needle: &str) {
        let mut rules = self.rules.lock().unwrap();
        rules.retain(|r| r.needle != needle);
        rules.insert(
            0,
            Rule {
                needle: needle.to_string(),
                queue: VecDeque::new(),
                fallback: ok(""),
                hang: true,
            },
        );
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn target(&self) -> &str {
        &self.name
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, CommandError> {
        self.history.lock().unwrap().push(script.to_string());

        let response = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|rule| script.contains(&rule.needle))
                .map(|rule| {
                    let output = rule.queue.pop_front().unwrap_or_else(|| rule.fallback.clone());
                    (output, rule.hang)
                })
        };

        match response {
            Some((_, true)) => std::future::pending().await,
            Some((output, false)) => Ok(output),
            None => Ok(ok("")),
        }
    }
}

/// Hands out one scripted runner per hostname
pub struct ScriptedConnector {
    runners: HashMap<String, Arc<ScriptedRunner>>,
}

impl ScriptedConnector {
    pub fn healthy(nodes: &[NodeDescriptor]) -> Self {
        Self {
            runners: nodes
                .iter()
                .map(|n| (n.hostname.clone(), Arc::new(ScriptedRunner::healthy(&n.hostname))))
                .collect(),
        }
    }

    pub fn runner(&self, hostname: &str) -> Arc<ScriptedRunner> {
        self.runners[hostname].clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, node: &NodeDescriptor) -> Arc<dyn CommandRunner> {
        self.runners
            .get(&node.hostname)
            .cloned()
            .unwrap_or_else(|| Arc::new(ScriptedRunner::new(&node.hostname)))
    }
}
