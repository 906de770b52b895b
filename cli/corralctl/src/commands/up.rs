//! Bring-up command.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use corral_provisioner::bringup::Orchestrator;
use corral_provisioner::config::BringUpConfig;
use corral_readiness::WaitPolicy;
use corral_remote::{OpensshFactory, SessionFactory, SshAuth};

use crate::output::{print_output, print_single, print_success, OutputFormat};

use super::{ClusterArgs, CommandContext};

/// Bring-up arguments.
#[derive(Debug, Args)]
pub struct UpCommand {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// SSH username.
    #[arg(long, env = "CORRAL_SSH_USER", default_value = "root")]
    ssh_user: String,

    /// SSH password.
    #[arg(long, env = "CORRAL_SSH_PASSWORD", default_value = "r00tme")]
    ssh_password: String,

    /// SSH identity file; switches to key authentication.
    #[arg(long, env = "CORRAL_SSH_IDENTITY")]
    ssh_identity: Option<PathBuf>,

    /// Ceiling for the reachability and certificate waits, in seconds.
    #[arg(long, env = "CORRAL_READY_TIMEOUT_SECS", default_value_t = 1800)]
    ready_timeout_secs: u64,

    /// Poll interval for bounded waits, in seconds.
    #[arg(long, env = "CORRAL_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Config template for the control node.
    #[arg(
        long,
        env = "CORRAL_CONTROL_TEMPLATE",
        default_value = "config/puppet.master.conf"
    )]
    control_template: PathBuf,

    /// Config template for agents.
    #[arg(
        long,
        env = "CORRAL_AGENT_TEMPLATE",
        default_value = "config/puppet.agent.conf"
    )]
    agent_template: PathBuf,

    /// Also write peer host entries on the control node.
    #[arg(long, env = "CORRAL_PEER_HOSTS_ON_CONTROL")]
    peer_hosts_on_control: bool,

    /// Snapshot label for the clean checkpoint.
    #[arg(long, env = "CORRAL_SNAPSHOT_LABEL", default_value = "empty")]
    snapshot_label: String,
}

/// Node row for the report table.
#[derive(Debug, Serialize, Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    name: String,

    #[tabled(rename = "Role")]
    role: String,

    #[tabled(rename = "Address", display = "display_option")]
    address: Option<IpAddr>,
}

fn display_option(opt: &Option<IpAddr>) -> String {
    opt.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl UpCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let auth = match &self.ssh_identity {
            Some(identity) => SshAuth::identity(&self.ssh_user, identity.clone()),
            None => SshAuth::password(&self.ssh_user, &self.ssh_password),
        };
        let poll_interval = Duration::from_secs(self.poll_interval_secs.max(1));
        let policy = WaitPolicy::new(Duration::from_secs(self.ready_timeout_secs), poll_interval);

        let config = BringUpConfig {
            cluster: self.cluster.spec(&ctx.env_name),
            auth,
            reach_policy: policy,
            cert_policy: policy,
            control_template_path: self.control_template,
            agent_template_path: self.agent_template,
            peer_hosts_on_control: self.peer_hosts_on_control,
            snapshot_label: self.snapshot_label,
            state_dir: ctx.state_dir.clone(),
        };

        let sessions: Arc<dyn SessionFactory> = Arc::new(OpensshFactory::new());
        let mut orchestrator = Orchestrator::new(ctx.backend(), sessions, config);
        let report = orchestrator.ensure_environment().await?;

        match ctx.format {
            OutputFormat::Table => {
                let rows: Vec<NodeRow> = report
                    .nodes
                    .iter()
                    .map(|node| NodeRow {
                        name: node.name.clone(),
                        role: node.role.as_str().to_string(),
                        address: node.address,
                    })
                    .collect();
                print_output(&rows, ctx.format);
                let how = if report.resumed { "resumed" } else { "built" };
                print_success(&format!(
                    "Environment '{}' {how} ({})",
                    report.environment, report.phase
                ));
            }
            OutputFormat::Json => print_single(&report, ctx.format),
        }
        Ok(())
    }
}
