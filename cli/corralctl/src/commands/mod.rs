//! CLI commands.

mod destroy;
mod plan;
mod serve;
mod status;
mod up;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use corral_provisioner::backend::Backend;
use corral_provisioner::config::BackendKind;
use corral_provisioner::virsh::{VirshBackend, VirshBackendConfig};
use corral_provisioner::MockBackend;
use corral_topology::ClusterSpec;

use crate::error::CliError;
use crate::output::OutputFormat;

/// Corral CLI - Bring up and manage virtual test clusters.
#[derive(Debug, Parser)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Environment name.
    #[arg(long, global = true, env = "CORRAL_ENV_NAME", default_value = "recipes")]
    env_name: String,

    /// Backend implementation (mock or virsh).
    #[arg(long, global = true, env = "CORRAL_BACKEND", default_value = "virsh")]
    backend: String,

    /// Directory for persisted environment records.
    #[arg(
        long,
        global = true,
        env = "CORRAL_STATE_DIR",
        default_value = "/var/lib/corral/envs"
    )]
    state_dir: PathBuf,

    /// Directory for node disk overlays (virsh backend).
    #[arg(
        long,
        global = true,
        env = "CORRAL_IMAGE_DIR",
        default_value = "/var/lib/corral/images"
    )]
    image_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the environment up, resuming a persisted record if present.
    Up(up::UpCommand),

    /// Tear the environment down.
    Destroy(destroy::DestroyCommand),

    /// Show the persisted environment record.
    Status(status::StatusCommand),

    /// Print the described topology without touching any backend.
    Plan(plan::PlanCommand),

    /// Serve a directory of artifacts over HTTP until interrupted.
    Serve(serve::ServeCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let backend = BackendKind::from_str(&self.backend)
            .ok_or_else(|| CliError::UnknownBackend(self.backend.clone()))?;

        let ctx = CommandContext {
            format,
            env_name: self.env_name,
            backend,
            state_dir: self.state_dir,
            image_dir: self.image_dir,
        };

        match self.command {
            Commands::Up(cmd) => cmd.run(ctx).await,
            Commands::Destroy(cmd) => cmd.run(ctx).await,
            Commands::Status(cmd) => cmd.run(ctx).await,
            Commands::Plan(cmd) => cmd.run(ctx).await,
            Commands::Serve(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("corral {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub env_name: String,
    pub backend: BackendKind,
    pub state_dir: PathBuf,
    pub image_dir: PathBuf,
}

impl CommandContext {
    /// Build the selected backend.
    pub fn backend(&self) -> Arc<dyn Backend> {
        match self.backend {
            BackendKind::Mock => Arc::new(MockBackend::new()),
            BackendKind::Virsh => Arc::new(VirshBackend::new(VirshBackendConfig {
                image_dir: self.image_dir.clone(),
                state_dir: self.state_dir.clone(),
                ..VirshBackendConfig::default()
            })),
        }
    }
}

/// Cluster shape flags shared by `up` and `plan`.
#[derive(Debug, Args)]
pub struct ClusterArgs {
    /// Base image every node boots from.
    #[arg(long, env = "CORRAL_BASE_IMAGE")]
    pub base_image: PathBuf,

    /// Number of agent nodes.
    #[arg(long, env = "CORRAL_AGENT_COUNT", default_value_t = 4)]
    pub agents: u32,

    /// Memory per node in MiB.
    #[arg(long, env = "CORRAL_NODE_MEMORY_MIB", default_value_t = 1024)]
    pub memory_mib: u32,

    /// Disable the per-node VNC console.
    #[arg(long)]
    pub no_vnc: bool,
}

impl ClusterArgs {
    pub fn spec(&self, name: &str) -> ClusterSpec {
        ClusterSpec {
            name: name.to_string(),
            base_image: self.base_image.clone(),
            agent_count: self.agents,
            memory_mib: self.memory_mib,
            vnc: !self.no_vnc,
        }
    }
}
