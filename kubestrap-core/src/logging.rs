//! Logging configuration module
//! Console output plus an optional rolling JSON file for post-mortem of failed runs

use crate::config::LoggingSection;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,             // log level (trace, debug, info, warn, error)
    pub log_dir: Option<PathBuf>,  // directory for rolling log files
    pub rotation: LogRotation,     // log rotation policy
    pub json_console: bool,        // JSON on the console instead of text
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: LogRotation::Daily,
            json_console: false,
        }
    }
}

impl From<&LoggingSection> for LoggingConfig {
    fn from(section: &LoggingSection) -> Self {
        Self {
            level: section.level.clone(),
            log_dir: section.log_dir.clone(),
            rotation: section.rotation,
            json_console: section.json,
        }
    }
}

impl LoggingConfig {
    /// Initialize logging. The returned guard must be held for the lifetime of
    /// the process, otherwise buffered file output is lost.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        // Logs go to stderr so command output (tables, JSON reports) stays clean
        let console_layer = if self.json_console {
            fmt::layer()
                .with_target(false)
                .json()
                .with_writer(io::stderr)
                .boxed()
        } else {
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(true)
                .with_writer(io::stderr)
                .boxed()
        };

        let (file_layer, guard) = match self.log_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                let file_appender = match self.rotation {
                    LogRotation::Hourly => rolling::hourly(dir, "kubestrap.log"),
                    LogRotation::Daily => rolling::daily(dir, "kubestrap.log"),
                    LogRotation::Never => rolling::never(dir, "kubestrap.log"),
                };

                let (writer, guard) = non_blocking(file_appender);
                let layer = fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_writer(writer)
                    .boxed();

                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()?;

        tracing::debug!("Logging initialized - level: {}", self.level);

        Ok(guard)
    }
}

/// Log a stage transition with the node and stage as structured fields
#[macro_export]
macro_rules! log_stage {
    ($node:expr, $stage:expr, $msg:literal) => {
        tracing::info!(node = %$node, stage = %$stage, $msg)
    };
    ($node:expr, $stage:expr, $msg:literal, $($field:tt)+) => {
        tracing::info!(node = %$node, stage = %$stage, $($field)+, $msg)
    };
}

/// Log captured output of an external command
#[macro_export]
macro_rules! log_command {
    ($target:expr, $output:expr) => {
        tracing::debug!(
            target_host = %$target,
            exit_code = $output.status,
            stdout = %$output.stdout.trim_end(),
            stderr = %$output.stderr.trim_end(),
            "Command finished"
        )
    };
}
