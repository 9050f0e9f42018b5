//! Kubestrap core library
//!
//! Bootstraps a kubeadm cluster on freshly created VMs: loads the cluster
//! settings, plans the nodes, runs the control-plane and worker pipelines over
//! SSH and validates the result.

// Configuration
pub mod config;
pub mod settings;
pub mod validation;

// Planning
pub mod network;
pub mod provisioner;

// Execution
pub mod context;
pub mod runner;
pub mod retry;
pub mod health;
pub mod kubectl;
pub mod stages;
pub mod rollback;
pub mod orchestrator;
pub mod validator;
pub mod provider;

// Infrastructure
pub mod error;
pub mod logging;
pub mod shutdown;

pub use config::KubestrapConfig;
pub use context::{Interruption, RunContext};
pub use error::BootstrapError;
pub use orchestrator::{Orchestrator, RunOutcome};
pub use settings::ClusterSpec;
