//! Provisioner configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use corral_readiness::WaitPolicy;
use corral_remote::SshAuth;
use corral_topology::ClusterSpec;

/// Which backend implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-memory mock, for tests and dry runs.
    Mock,
    /// Libvirt command line tools.
    Virsh,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Virsh => "virsh",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "mock" => Some(Self::Mock),
            "virsh" => Some(Self::Virsh),
            _ => None,
        }
    }
}

/// Everything one bring-up run needs.
#[derive(Debug, Clone)]
pub struct BringUpConfig {
    /// The cluster to describe and build.
    pub cluster: ClusterSpec,

    /// SSH credentials, shared by every node.
    pub auth: SshAuth,

    /// Bound on the per-node reachability wait.
    pub reach_policy: WaitPolicy,

    /// Bound on the per-agent certificate acknowledgment wait.
    pub cert_policy: WaitPolicy,

    /// Config template for the configuration-management server.
    pub control_template_path: PathBuf,

    /// Config template for agents.
    pub agent_template_path: PathBuf,

    /// Also write peer host entries on the control node.
    pub peer_hosts_on_control: bool,

    /// Label for the post-bring-up checkpoint of every node.
    pub snapshot_label: String,

    /// Directory for persisted environment records.
    pub state_dir: PathBuf,
}

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    pub bring_up: BringUpConfig,

    /// Backend implementation to use.
    pub backend: BackendKind,

    /// Directory for node disk overlays (virsh backend).
    pub image_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("CORRAL_ENV_NAME").unwrap_or_else(|_| "recipes".to_string());

        let base_image = std::env::var("CORRAL_BASE_IMAGE")
            .map(PathBuf::from)
            .context("Missing base image. Set CORRAL_BASE_IMAGE to the boot disk image path.")?;

        let agent_count: u32 = std::env::var("CORRAL_AGENT_COUNT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_AGENT_COUNT must be an integer.")?
            .unwrap_or(4);

        let memory_mib: u32 = std::env::var("CORRAL_NODE_MEMORY_MIB")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_NODE_MEMORY_MIB must be an integer (MiB).")?
            .unwrap_or(1024);

        let vnc = flag("CORRAL_VNC", true);

        let user = std::env::var("CORRAL_SSH_USER").unwrap_or_else(|_| "root".to_string());
        let auth = match std::env::var("CORRAL_SSH_IDENTITY").ok() {
            Some(path) => SshAuth::identity(user, PathBuf::from(path)),
            None => {
                let password =
                    std::env::var("CORRAL_SSH_PASSWORD").unwrap_or_else(|_| "r00tme".to_string());
                SshAuth::password(user, password)
            }
        };

        let ready_timeout_secs: u64 = std::env::var("CORRAL_READY_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_READY_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(1800);

        let poll_interval_secs: u64 = std::env::var("CORRAL_POLL_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_POLL_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(5);

        // The certificate acknowledgment ceiling defaults to the
        // reachability ceiling.
        let cert_timeout_secs: u64 = std::env::var("CORRAL_CERT_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_CERT_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(ready_timeout_secs);

        let poll_interval = Duration::from_secs(poll_interval_secs.max(1));
        let reach_policy = WaitPolicy::new(Duration::from_secs(ready_timeout_secs), poll_interval);
        let cert_policy = WaitPolicy::new(Duration::from_secs(cert_timeout_secs), poll_interval);

        let control_template_path = std::env::var("CORRAL_CONTROL_TEMPLATE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/puppet.master.conf"));

        let agent_template_path = std::env::var("CORRAL_AGENT_TEMPLATE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/puppet.agent.conf"));

        let peer_hosts_on_control = flag("CORRAL_PEER_HOSTS_ON_CONTROL", false);

        let snapshot_label =
            std::env::var("CORRAL_SNAPSHOT_LABEL").unwrap_or_else(|_| "empty".to_string());

        let state_dir = std::env::var("CORRAL_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/corral/envs"));

        let image_dir = std::env::var("CORRAL_IMAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/corral/images"));

        let backend = match std::env::var("CORRAL_BACKEND") {
            Ok(v) => BackendKind::from_str(&v)
                .with_context(|| format!("Unknown backend {v:?}. Valid values: mock, virsh."))?,
            Err(_) => BackendKind::Virsh,
        };

        let log_level = std::env::var("CORRAL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            bring_up: BringUpConfig {
                cluster: ClusterSpec {
                    name,
                    base_image,
                    agent_count,
                    memory_mib,
                    vnc,
                },
                auth,
                reach_policy,
                cert_policy,
                control_template_path,
                agent_template_path,
                peer_hosts_on_control,
                snapshot_label,
                state_dir,
            },
            backend,
            image_dir,
            log_level,
        })
    }
}

fn flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
