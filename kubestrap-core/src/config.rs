//! Orchestrator configuration
//!
//! Tunes how a run executes (retry bounds, wait timeouts, SSH access, shared
//! directory). The cluster itself is described by the settings file; this is
//! loaded from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use crate::logging::LogRotation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubestrapConfig {
    /// Retry policy for idempotent package installs
    pub retry: RetryConfig,
    /// Readiness wait bounds
    pub waits: WaitConfig,
    /// Shared artifact locations
    pub paths: PathsConfig,
    /// SSH access to the nodes
    pub ssh: SshConfig,
    /// VM provider
    pub vagrant: VagrantConfig,
    /// Whole-run behaviour
    pub run: RunConfig,
    /// Logging configuration
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub api_server_timeout_secs: u64,
    pub api_server_interval_secs: u64,
    pub pod_timeout_secs: u64,
    pub pod_interval_secs: u64,
    pub node_health_timeout_secs: u64,
    pub node_health_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory shared between the control node and the workers
    pub shared_dir: PathBuf,
    /// Join script file name inside `shared_dir`
    pub join_script: String,
    /// Admin kubeconfig file name inside `shared_dir`
    pub kubeconfig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    /// Private key file passed to `ssh -i`
    pub identity_file: Option<PathBuf>,
    /// Inline private key, staged to a temporary file per command
    pub private_key: Option<String>,
    pub connect_timeout_secs: u64,
    /// Address used to reach the nodes
    pub use_private_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VagrantConfig {
    pub binary: String,
    /// Directory holding the Vagrantfile
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Overall run deadline; unset means no deadline
    pub deadline_secs: Option<u64>,
    /// Run worker pipelines concurrently
    pub parallel_workers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for rolling log files; unset disables file logging
    pub log_dir: Option<PathBuf>,
    /// Log file rotation (hourly, daily, never)
    pub rotation: LogRotation,
    /// Emit JSON on the console
    pub json: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_secs: 10,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            api_server_timeout_secs: 180,
            api_server_interval_secs: 5,
            pod_timeout_secs: 300,
            pod_interval_secs: 10,
            node_health_timeout_secs: 300,
            node_health_interval_secs: 10,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            shared_dir: PathBuf::from("./configs"),
            join_script: "join.sh".to_string(),
            kubeconfig: "config".to_string(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "vagrant".to_string(),
            port: 22,
            identity_file: None,
            private_key: None,
            connect_timeout_secs: 10,
            use_private_network: false,
        }
    }
}

impl Default for VagrantConfig {
    fn default() -> Self {
        Self {
            binary: "vagrant".to_string(),
            working_dir: PathBuf::from("."),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: LogRotation::default(),
            json: false,
        }
    }
}

impl KubestrapConfig {
    /// Load from an explicit path, or the first standard location that exists,
    /// then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::find_config_file() {
                Some(path) => Self::load_from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("KUBESTRAP_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/kubestrap/config.toml")),
            Some(PathBuf::from("./kubestrap.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Retry
        if let Some(attempts) = env_parse("KUBESTRAP_RETRY_ATTEMPTS") {
            self.retry.max_attempts = attempts;
        }
        if let Some(backoff) = env_parse("KUBESTRAP_RETRY_BACKOFF_SECS") {
            self.retry.backoff_secs = backoff;
        }

        // Paths
        if let Ok(dir) = std::env::var("KUBESTRAP_SHARED_DIR") {
            self.paths.shared_dir = PathBuf::from(dir);
        }

        // SSH
        if let Ok(user) = std::env::var("KUBESTRAP_SSH_USER") {
            self.ssh.user = user;
        }
        if let Some(port) = env_parse("KUBESTRAP_SSH_PORT") {
            self.ssh.port = port;
        }
        if let Ok(path) = std::env::var("KUBESTRAP_SSH_IDENTITY") {
            self.ssh.identity_file = Some(PathBuf::from(path));
        }

        // Vagrant
        if let Ok(binary) = std::env::var("KUBESTRAP_VAGRANT_BIN") {
            self.vagrant.binary = binary;
        }
        if let Ok(dir) = std::env::var("KUBESTRAP_VAGRANT_DIR") {
            self.vagrant.working_dir = PathBuf::from(dir);
        }

        // Run
        if let Some(deadline) = env_parse("KUBESTRAP_DEADLINE_SECS") {
            self.run.deadline_secs = Some(deadline);
        }
        if let Some(parallel) = env_parse("KUBESTRAP_PARALLEL_WORKERS") {
            self.run.parallel_workers = parallel;
        }

        // Logging
        if let Ok(level) = std::env::var("KUBESTRAP_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(dir) = std::env::var("KUBESTRAP_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let waits = &self.waits;
        let pairs = [
            ("api_server", waits.api_server_timeout_secs, waits.api_server_interval_secs),
            ("pod", waits.pod_timeout_secs, waits.pod_interval_secs),
            ("node_health", waits.node_health_timeout_secs, waits.node_health_interval_secs),
        ];
        for (name, timeout, interval) in pairs {
            if interval == 0 || interval > timeout {
                return Err(ConfigError::Validation(format!(
                    "waits.{}_interval_secs must be between 1 and waits.{}_timeout_secs",
                    name, name
                )));
            }
        }

        if self.paths.join_script.is_empty() || self.paths.join_script.contains('/') {
            return Err(ConfigError::Validation(
                "paths.join_script must be a plain file name".to_string(),
            ));
        }

        if self.ssh.user.is_empty() {
            return Err(ConfigError::Validation("ssh.user cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl WaitConfig {
    pub fn api_server(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.api_server_timeout_secs),
            Duration::from_secs(self.api_server_interval_secs),
        )
    }

    pub fn pods(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.pod_timeout_secs),
            Duration::from_secs(self.pod_interval_secs),
        )
    }

    pub fn node_health(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.node_health_timeout_secs),
            Duration::from_secs(self.node_health_interval_secs),
        )
    }
}

impl PathsConfig {
    /// Location of the join artifact
    pub fn join_script_path(&self) -> PathBuf {
        self.shared_dir.join(&self.join_script)
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.shared_dir.join(&self.kubeconfig)
    }
}

impl RunConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KubestrapConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff(), Duration::from_secs(10));
        assert_eq!(
            config.waits.api_server(),
            (Duration::from_secs(180), Duration::from_secs(5))
        );
        assert_eq!(
            config.waits.pods(),
            (Duration::from_secs(300), Duration::from_secs(10))
        );
        assert_eq!(
            config.paths.join_script_path(),
            PathBuf::from("./configs/join.sh")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = KubestrapConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = KubestrapConfig::default();
        config.waits.pod_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = KubestrapConfig::default();
        config.waits.api_server_interval_secs = 200;
        assert!(config.validate().is_err());

        let mut config = KubestrapConfig::default();
        config.paths.join_script = "../join.sh".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubestrap.toml");
        std::fs::write(&path, "[retry]\nmax_attempts = 3\n\n[ssh]\nuser = \"ubuntu\"\n").unwrap();

        let config = KubestrapConfig::load_from_file(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_secs, 10);
        assert_eq!(config.ssh.user, "ubuntu");
        assert_eq!(config.waits.node_health_timeout_secs, 300);
        assert_eq!(config.logging.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_log_rotation_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubestrap.toml");
        std::fs::write(
            &path,
            "[logging]\nlog_dir = \"/var/log/kubestrap\"\nrotation = \"never\"\n",
        )
        .unwrap();

        let config = KubestrapConfig::load_from_file(&path).unwrap();
        assert_eq!(config.logging.rotation, LogRotation::Never);
    }

    #[test]
    fn test_generate_sample_config() {
        let sample = KubestrapConfig::generate_sample();
        assert!(sample.contains("[retry]"));
        assert!(sample.contains("[waits]"));
        assert!(sample.contains("[paths]"));
        assert!(sample.contains("[ssh]"));
        assert!(sample.contains("[vagrant]"));
        assert!(sample.contains("[logging]"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = KubestrapConfig::load_from_file(Path::new("/nonexistent/kubestrap.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(_, _)));
    }
}
