//! Corral Provisioner
//!
//! One-shot runner: adopts the configured environment if a record exists,
//! otherwise brings a fresh one up through the full sequence, then exits.
//! Interrupting with ctrl-c leaves whatever was built in place; a later
//! run resumes from the persisted record and `corralctl destroy` tears
//! it down.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use corral_provisioner::backend::Backend;
use corral_provisioner::bringup::Orchestrator;
use corral_provisioner::config::{BackendKind, Config};
use corral_provisioner::virsh::{VirshBackend, VirshBackendConfig};
use corral_provisioner::MockBackend;
use corral_remote::OpensshFactory;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting corral provisioner");
    info!(
        environment = %config.bring_up.cluster.name,
        backend = config.backend.as_str(),
        agents = config.bring_up.cluster.agent_count,
        "Configuration loaded"
    );

    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Mock => Arc::new(MockBackend::new()),
        BackendKind::Virsh => Arc::new(VirshBackend::new(VirshBackendConfig {
            image_dir: config.image_dir.clone(),
            state_dir: config.bring_up.state_dir.clone(),
            ..VirshBackendConfig::default()
        })),
    };
    let sessions = Arc::new(OpensshFactory::new());

    let mut orchestrator = Orchestrator::new(backend, sessions, config.bring_up);

    tokio::select! {
        result = orchestrator.ensure_environment() => {
            match result {
                Ok(report) => {
                    for node in &report.nodes {
                        match node.address {
                            Some(address) => {
                                info!(node = %node.name, role = %node.role, address = %address, "Node ready")
                            }
                            None => info!(node = %node.name, role = %node.role, "Node ready"),
                        }
                    }
                    info!(
                        environment = %report.environment,
                        phase = %report.phase,
                        resumed = report.resumed,
                        "Environment ready"
                    );
                    Ok(())
                }
                Err(failure) => {
                    error!(reached = %failure.reached, error = %failure.source, "Bring-up failed");
                    Err(failure.into())
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}
