//! Remote command execution
//!
//! Every stage talks to its node through a [`CommandRunner`]. Production runs
//! use [`SshRunner`]; tests substitute scripted runners.

use crate::config::SshConfig;
use async_trait::async_trait;
use kubestrap_common::NodeDescriptor;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn from_process(output: std::process::Output) -> Self {
        Self {
            // Killed by signal: no code
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start command on {target}: {source}")]
    Spawn {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command on {target} exited with status {status}: {stderr}")]
    Failed {
        target: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to stage ssh key: {0}")]
    KeyFile(#[source] std::io::Error),
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable name of the machine commands run on
    fn target(&self) -> &str;

    /// Run a shell script and capture its output regardless of exit status
    async fn exec(&self, script: &str) -> Result<CommandOutput, CommandError>;

    /// Run a shell script, treating a non-zero exit as an error
    async fn run(&self, script: &str) -> Result<String, CommandError> {
        let output = self.exec(script).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                target: self.target().to_string(),
                status: output.status,
                stderr: last_lines(&output.stderr, 20),
            });
        }
        Ok(output.stdout)
    }
}

/// Hands out a runner for each planned node
pub trait Connector: Send + Sync {
    fn connect(&self, node: &NodeDescriptor) -> Arc<dyn CommandRunner>;
}

/// Runs scripts on the local machine through `bash -c`
#[derive(Debug, Clone)]
pub struct LocalRunner {
    name: String,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            name: "localhost".to_string(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    fn target(&self) -> &str {
        &self.name
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, CommandError> {
        let output = Command::new("bash")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                target: self.name.clone(),
                source,
            })?;

        let output = CommandOutput::from_process(output);
        crate::log_command!(self.name, output);
        Ok(output)
    }
}

/// Runs scripts on a node over ssh
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: Ipv4Addr,
    name: String,
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
    private_key: Option<Arc<String>>,
    connect_timeout: Duration,
}

impl SshRunner {
    pub fn new(name: impl Into<String>, host: Ipv4Addr, config: &SshConfig) -> Self {
        Self {
            host,
            name: name.into(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            private_key: config.private_key.clone().map(Arc::new),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Options shared by every invocation, excluding the key and the script
    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-p".to_string(),
            self.port.to_string(),
        ]
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    fn target(&self) -> &str {
        &self.name
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, CommandError> {
        let mut ssh_cmd = Command::new("ssh");
        ssh_cmd.args(self.base_args()).kill_on_drop(true);

        // Held until the command finishes; the file is removed on drop
        let mut _key_file = None;
        if let Some(key) = &self.private_key {
            let file = tempfile::NamedTempFile::new().map_err(CommandError::KeyFile)?;
            tokio::fs::write(file.path(), key.as_bytes())
                .await
                .map_err(CommandError::KeyFile)?;
            restrict_permissions(file.path()).map_err(CommandError::KeyFile)?;
            ssh_cmd.arg("-i").arg(file.path());
            _key_file = Some(file);
        } else if let Some(identity) = &self.identity_file {
            ssh_cmd.arg("-i").arg(identity);
        }

        ssh_cmd
            .arg(self.destination())
            .arg(format!("bash -c {}", shell_quote(script)));

        let output = ssh_cmd.output().await.map_err(|source| CommandError::Spawn {
            target: self.name.clone(),
            source,
        })?;

        let output = CommandOutput::from_process(output);
        crate::log_command!(self.name, output);
        Ok(output)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

/// Connects to nodes over ssh using their public or private address
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl Connector for SshConnector {
    fn connect(&self, node: &NodeDescriptor) -> Arc<dyn CommandRunner> {
        let host = if self.config.use_private_network {
            node.private_ip
        } else {
            node.public_ip
        };
        Arc::new(SshRunner::new(node.hostname.clone(), host, &self.config))
    }
}

/// Runs every node's scripts on this machine (single-host labs)
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn connect(&self, node: &NodeDescriptor) -> Arc<dyn CommandRunner> {
        Arc::new(LocalRunner::named(node.hostname.clone()))
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Last `n` lines of command output, for error messages and diagnostics
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_last_lines() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(last_lines(text, 2), "c\nd");
        assert_eq!(last_lines(text, 10), "a\nb\nc\nd");
        assert_eq!(last_lines("", 3), "");
    }

    #[test]
    fn test_ssh_args() {
        let config = SshConfig {
            port: 2222,
            ..Default::default()
        };
        let runner = SshRunner::new("node01", Ipv4Addr::new(192, 168, 1, 11), &config);
        let args = runner.base_args();

        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert_eq!(runner.destination(), "vagrant@192.168.1.11");
        assert_eq!(runner.target(), "node01");
    }

    #[test]
    fn test_connector_picks_network() {
        let node = NodeDescriptor {
            role: kubestrap_common::NodeRole::Worker,
            hostname: "node01".to_string(),
            public_ip: Ipv4Addr::new(192, 168, 1, 11),
            private_ip: Ipv4Addr::new(172, 16, 0, 21),
            resources: kubestrap_common::NodeResources {
                cpus: 1,
                memory_mb: 2048,
            },
        };

        let public = SshConnector::new(SshConfig::default());
        assert_eq!(public.connect(&node).target(), "node01");

        let runner = SshRunner::new(
            "node01",
            node.private_ip,
            &SshConfig {
                use_private_network: true,
                ..Default::default()
            },
        );
        assert_eq!(runner.destination(), "vagrant@172.16.0.21");
    }

    #[tokio::test]
    async fn test_local_runner_captures_output() {
        let runner = LocalRunner::new();
        let output = runner.exec("echo out; echo err >&2; exit 3").await.unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_maps_nonzero_exit() {
        let runner = LocalRunner::new();
        assert_eq!(runner.run("printf ok").await.unwrap(), "ok");

        match runner.run("echo boom >&2; false").await {
            Err(CommandError::Failed { status, stderr, .. }) => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
