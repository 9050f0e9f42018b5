//! Kubestrap CLI
//!
//! Bootstraps a kubeadm cluster on Vagrant VMs and reports the outcome. The
//! process exit code follows the failure class of the run.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kubestrap::error::exit_code;
use kubestrap::logging::LoggingConfig;
use kubestrap::{BootstrapError, KubestrapConfig};
use kubestrap_common::NodeRole;
use output::OutputFormat;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Cluster settings file
    #[arg(short, long, global = true, default_value = "settings.yaml")]
    settings: PathBuf,

    /// Orchestrator config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (table, json, yaml)
    #[arg(short, long, global = true, default_value = "table")]
    output: String,

    /// Log level, overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the settings file
    Validate,
    /// Show the planned nodes
    Plan,
    /// Create the VMs and bootstrap the whole cluster
    Up {
        /// Run worker pipelines concurrently
        #[arg(long)]
        parallel_workers: bool,
        /// Assume the VMs already exist
        #[arg(long)]
        skip_vms: bool,
    },
    /// Run one node's pipeline on this machine
    Node {
        /// Node role (control, worker)
        #[arg(short, long)]
        role: String,
        /// Node hostname
        #[arg(short, long)]
        name: String,
    },
    /// Validate a bootstrapped cluster
    Verify,
    /// Destroy every VM
    Destroy {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Orchestrator configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a sample config file with every default
    Sample,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output::print_error(&format!("{:#}", err));
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::from_str(&cli.output);

    // Commands that need neither config nor logging
    match cli.command {
        Commands::Completions { shell } => {
            generate_completions(shell);
            return Ok(());
        }
        Commands::Config {
            command: ConfigCommands::Sample,
        } => {
            print!("{}", KubestrapConfig::generate_sample());
            return Ok(());
        }
        _ => {}
    }

    let mut config = KubestrapConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _guard = LoggingConfig::from(&config.logging)
        .init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Validate => commands::settings::validate(&cli.settings, format),
        Commands::Plan => commands::settings::plan(&cli.settings, format),
        Commands::Up {
            parallel_workers,
            skip_vms,
        } => {
            if parallel_workers {
                config.run.parallel_workers = true;
            }
            commands::cluster::up(&cli.settings, config, skip_vms, format).await
        }
        Commands::Node { role, name } => {
            let role = role.parse::<NodeRole>().context("Invalid --role")?;
            commands::node::run(&cli.settings, config, role, &name, format).await
        }
        Commands::Verify => commands::cluster::verify(&cli.settings, config, format).await,
        Commands::Destroy { yes } => commands::vm::destroy(&config, yes).await,
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    }
}

/// Bootstrap failures carry their own exit code; anything else is a
/// configuration or environment problem
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<BootstrapError>()
        .map_or(exit_code::CONFIGURATION, BootstrapError::exit_code)
}

/// Generate shell completions
fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();

    generate(shell, &mut cmd, name, &mut io::stdout());
}
