//! Bring-up orchestration.
//!
//! Drives one environment from description to snapshot through a fixed
//! sequence of phases. Per-node work runs sequentially, so the certificate
//! exchange stays auditable in the logs. Any step failure aborts the run
//! and leaves partially built resources behind for [`Orchestrator::destroy`].

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use corral_readiness::{wait_until, WaitError};
use corral_remote::{RemoteSession, SessionFactory};
use corral_topology::{describe, NodeRole};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backend::{Backend, Environment};
use crate::config::BringUpConfig;
use crate::configure::{PeerHost, RoleConfigurator};
use crate::error::ProvisionError;

/// Bring-up lifecycle phase.
///
/// Progress phases advance strictly in declaration order; `Failed` is the
/// terminal phase of an aborted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing has happened yet.
    Idle,
    /// The target topology is described.
    Described,
    /// Backend resources exist and the record is persisted.
    Materialized,
    /// Every node is booted.
    Started,
    /// Every node accepts connections on the ssh port.
    AllReachable,
    /// Every node knows its own name.
    Renamed,
    /// The control node runs the configuration-management server.
    ControlConfigured,
    /// Every agent is configured and has requested a certificate.
    AgentsConfigured,
    /// All certificates are signed and acknowledged.
    CertsSigned,
    /// Every node is checkpointed.
    Snapshotted,
    /// The run aborted.
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Described => "described",
            Self::Materialized => "materialized",
            Self::Started => "started",
            Self::AllReachable => "all_reachable",
            Self::Renamed => "renamed",
            Self::ControlConfigured => "control_configured",
            Self::AgentsConfigured => "agents_configured",
            Self::CertsSigned => "certs_signed",
            Self::Snapshotted => "snapshotted",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "described" => Some(Self::Described),
            "materialized" => Some(Self::Materialized),
            "started" => Some(Self::Started),
            "all_reachable" => Some(Self::AllReachable),
            "renamed" => Some(Self::Renamed),
            "control_configured" => Some(Self::ControlConfigured),
            "agents_configured" => Some(Self::AgentsConfigured),
            "certs_signed" => Some(Self::CertsSigned),
            "snapshotted" => Some(Self::Snapshotted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node outcome in a report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub role: NodeRole,
    pub address: Option<IpAddr>,
}

/// Outcome of a successful bring-up or resume.
#[derive(Debug, Clone, Serialize)]
pub struct BringUpReport {
    pub environment: String,
    pub phase: Phase,

    /// True when an existing environment record was adopted instead of
    /// building a fresh one.
    pub resumed: bool,

    pub nodes: Vec<NodeReport>,
}

/// A failed bring-up, carrying the furthest phase that completed.
#[derive(Debug, Error)]
#[error("bring-up failed after reaching {reached}: {source}")]
pub struct BringUpFailure {
    pub reached: Phase,
    #[source]
    pub source: ProvisionError,
}

/// Drives backend and configuration steps for one environment.
///
/// The environment is a single value owned here for the duration of a
/// run; steps receive it explicitly and per-node work is sequential.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    sessions: Arc<dyn SessionFactory>,
    config: BringUpConfig,
    phase: Phase,
    environment: Option<Environment>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        sessions: Arc<dyn SessionFactory>,
        config: BringUpConfig,
    ) -> Self {
        Self {
            backend,
            sessions,
            config,
            phase: Phase::Idle,
            environment: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    /// Adopts the persisted environment under the configured name, or
    /// brings a fresh one up when there is no record. A record that
    /// exists but cannot be loaded is an error, never silently rebuilt.
    pub async fn ensure_environment(&mut self) -> Result<BringUpReport, BringUpFailure> {
        let name = self.config.cluster.name.clone();
        match self.backend.load(&name).await {
            Ok(Some(environment)) => {
                info!(environment = %name, "Loaded existing environment");
                self.environment = Some(environment);
                // The record only proves materialization; configuration
                // state is whatever the previous run left behind.
                self.phase = Phase::Materialized;
                Ok(self.report(true))
            }
            Ok(None) => self.bring_up().await,
            Err(source) => Err(BringUpFailure {
                reached: self.phase,
                source: source.into(),
            }),
        }
    }

    /// Runs the full bring-up sequence. On failure the error names the
    /// furthest phase that completed; partially built resources stay
    /// behind for [`Self::destroy`].
    pub async fn bring_up(&mut self) -> Result<BringUpReport, BringUpFailure> {
        match self.run_to_snapshot().await {
            Ok(()) => Ok(self.report(false)),
            Err(source) => {
                let reached = self.phase;
                self.phase = Phase::Failed;
                Err(BringUpFailure { reached, source })
            }
        }
    }

    /// Tears the environment down. Callable from any state, including
    /// after a failed bring-up. Destroying an environment that is already
    /// gone is a no-op.
    pub async fn destroy(&mut self) -> Result<(), ProvisionError> {
        let mut environment = match self.environment.take() {
            Some(environment) => environment,
            None => match self.backend.load(&self.config.cluster.name).await? {
                Some(environment) => environment,
                None => {
                    info!(environment = %self.config.cluster.name, "Nothing to destroy");
                    self.phase = Phase::Idle;
                    return Ok(());
                }
            },
        };

        if let Err(e) = self.backend.destroy(&mut environment).await {
            self.environment = Some(environment);
            return Err(e.into());
        }
        info!(environment = %environment.name, "Environment destroyed");
        self.phase = Phase::Idle;
        Ok(())
    }

    async fn run_to_snapshot(&mut self) -> Result<(), ProvisionError> {
        let configurator = self.load_configurator()?;

        info!(environment = %self.config.cluster.name, "Building environment");
        let topology = describe(&self.config.cluster)?;
        self.advance(Phase::Described);

        let environment = self.backend.materialize(topology).await?;
        self.backend.persist(&environment).await?;
        info!(environment = %environment.name, "Environment record saved");
        self.environment = Some(environment);
        self.advance(Phase::Materialized);

        self.start_all().await?;
        self.advance(Phase::Started);

        self.wait_all_reachable().await?;
        self.advance(Phase::AllReachable);

        self.rename_all(&configurator).await?;
        self.advance(Phase::Renamed);

        self.configure_control(&configurator).await?;
        self.advance(Phase::ControlConfigured);

        self.configure_agents(&configurator).await?;
        self.advance(Phase::AgentsConfigured);

        self.exchange_certificates(&configurator).await?;
        self.advance(Phase::CertsSigned);

        self.snapshot_all().await?;
        self.advance(Phase::Snapshotted);
        Ok(())
    }

    fn advance(&mut self, phase: Phase) {
        self.phase = phase;
        info!(phase = %phase, "Phase complete");
    }

    fn load_configurator(&self) -> Result<RoleConfigurator, ProvisionError> {
        let control = read_template(&self.config.control_template_path)?;
        let agent = read_template(&self.config.agent_template_path)?;
        Ok(RoleConfigurator::new(control, agent))
    }

    async fn start_all(&mut self) -> Result<(), ProvisionError> {
        let environment = self.environment.as_mut().ok_or_else(no_environment)?;

        info!("Starting test nodes");
        let names: Vec<String> = environment
            .topology
            .nodes
            .iter()
            .map(|n| n.name.clone())
            .collect();
        for name in &names {
            let address = self.backend.start(environment, name).await?;
            info!(node = %name, address = %address, "Node started");
        }
        Ok(())
    }

    async fn wait_all_reachable(&self) -> Result<(), ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;
        let backend = self.backend.as_ref();

        for node in &environment.topology.nodes {
            let address = node_address(node.address, &node.name)?;
            info!(node = %node.name, address = %address, "Waiting for ssh");
            let name = node.name.as_str();
            wait_until(name, self.config.reach_policy, || async move {
                backend.reachable(environment, name).await
            })
            .await
            .map_err(|e| wait_timeout(name, "ssh", e))?;
        }
        Ok(())
    }

    async fn rename_all(&self, configurator: &RoleConfigurator) -> Result<(), ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;

        for node in &environment.topology.nodes {
            let session = self.session_for(&node.name).await?;
            configurator
                .rename(session.as_ref(), &node.name)
                .await
                .map_err(|e| ProvisionError::exec(&node.name, "rename", e))?;
        }
        Ok(())
    }

    async fn configure_control(&self, configurator: &RoleConfigurator) -> Result<(), ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;
        let control = environment.control().ok_or_else(no_control)?;
        let name = control.name.clone();

        let session = self.session_for(&name).await?;
        if self.config.peer_hosts_on_control {
            configurator
                .add_peer_hosts(session.as_ref(), &peer_hosts(environment))
                .await
                .map_err(|e| ProvisionError::exec(&name, "peer-hosts", e))?;
        }
        configurator
            .configure_control(session.as_ref())
            .await
            .map_err(|e| ProvisionError::exec(&name, "configure-control", e))?;
        Ok(())
    }

    async fn configure_agents(&self, configurator: &RoleConfigurator) -> Result<(), ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;
        let peers = peer_hosts(environment);
        let agents: Vec<String> = environment.agents().map(|n| n.name.clone()).collect();

        for name in &agents {
            let session = self.session_for(name).await?;
            configurator
                .configure_agent(session.as_ref(), name, &peers)
                .await
                .map_err(|e| ProvisionError::exec(name, "configure-agent", e))?;
        }
        Ok(())
    }

    /// Signs every pending request exactly once, then confirms each agent
    /// picked its certificate up, then registers the extra repository on
    /// the control node.
    async fn exchange_certificates(
        &self,
        configurator: &RoleConfigurator,
    ) -> Result<(), ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;
        let control = environment.control().ok_or_else(no_control)?;
        let control_name = control.name.clone();
        let agents: Vec<String> = environment.agents().map(|n| n.name.clone()).collect();

        let control_session = self.session_for(&control_name).await?;
        configurator
            .sign_all_certificates(control_session.as_ref())
            .await
            .map_err(|e| ProvisionError::exec(&control_name, "sign-certificates", e))?;

        for name in &agents {
            let session = self.session_for(name).await?;
            configurator
                .await_certificate(session.as_ref(), name, self.config.cert_policy)
                .await
                .map_err(|e| wait_timeout(name, "certificate", e))?;
        }

        configurator
            .trust_extra_repository(control_session.as_ref())
            .await
            .map_err(|e| ProvisionError::exec(&control_name, "trust-extra-repository", e))?;
        Ok(())
    }

    async fn snapshot_all(&self) -> Result<(), ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;

        for node in &environment.topology.nodes {
            info!(node = %node.name, label = %self.config.snapshot_label, "Creating snapshot");
            self.backend
                .snapshot(environment, &node.name, &self.config.snapshot_label)
                .await?;
            if let Some(address) = node.address {
                info!(node = %node.name, address = %address, "Test node is ready");
            }
        }
        Ok(())
    }

    async fn session_for(&self, node_name: &str) -> Result<Box<dyn RemoteSession>, ProvisionError> {
        let environment = self.environment.as_ref().ok_or_else(no_environment)?;
        let address = node_address(environment.address_of(node_name), node_name)?;
        self.sessions
            .connect(address, &self.config.auth)
            .await
            .map_err(|e| ProvisionError::exec(node_name, "connect", e))
    }

    fn report(&self, resumed: bool) -> BringUpReport {
        let nodes = self
            .environment
            .as_ref()
            .map(|environment| {
                environment
                    .topology
                    .nodes
                    .iter()
                    .map(|n| NodeReport {
                        name: n.name.clone(),
                        role: n.role,
                        address: n.address,
                    })
                    .collect()
            })
            .unwrap_or_default();

        BringUpReport {
            environment: self.config.cluster.name.clone(),
            phase: self.phase,
            resumed,
            nodes,
        }
    }
}

fn peer_hosts(environment: &Environment) -> Vec<PeerHost> {
    environment
        .topology
        .nodes
        .iter()
        .filter_map(|n| {
            n.address.map(|address| PeerHost {
                name: n.name.clone(),
                address,
            })
        })
        .collect()
}

fn node_address(address: Option<IpAddr>, node: &str) -> Result<IpAddr, ProvisionError> {
    address.ok_or_else(|| ProvisionError::Internal(format!("node {node} has no address")))
}

fn no_environment() -> ProvisionError {
    ProvisionError::Internal("no active environment".to_string())
}

fn no_control() -> ProvisionError {
    ProvisionError::Internal("topology has no control node".to_string())
}

fn wait_timeout(node: &str, waiting_for: &str, err: WaitError) -> ProvisionError {
    let WaitError::Timeout { elapsed, .. } = err;
    ProvisionError::Timeout {
        node: node.to_string(),
        waiting_for: waiting_for.to_string(),
        elapsed,
    }
}

fn read_template(path: &Path) -> Result<String, ProvisionError> {
    std::fs::read_to_string(path).map_err(|e| ProvisionError::Template {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}
