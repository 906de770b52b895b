//! Libvirt backend.
//!
//! Drives the libvirt command line tools (`virsh`, `virt-install`,
//! `qemu-img`) to build real virtual machines from a topology. Networks
//! and domains are namespaced with the environment name so several
//! environments can coexist on one host. Environment records persist
//! through [`EnvStore`].

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use corral_readiness::{tcp_ping, SSH_PORT};
use corral_topology::{Network, Node, Topology};

use crate::backend::{Backend, BackendError, Environment};
use crate::store::EnvStore;

/// Budget for one TCP reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often to re-ask for a freshly started domain's address.
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for the libvirt backend.
#[derive(Debug, Clone)]
pub struct VirshBackendConfig {
    /// Path to the virsh binary.
    pub virsh_bin: PathBuf,
    /// Path to the virt-install binary.
    pub virt_install_bin: PathBuf,
    /// Path to the qemu-img binary.
    pub qemu_img_bin: PathBuf,
    /// Libvirt connection URI.
    pub connect_uri: String,
    /// Directory for node disk overlays.
    pub image_dir: PathBuf,
    /// Directory for environment records and definition files.
    pub state_dir: PathBuf,
    /// How long a started domain may take to report an address.
    pub address_timeout: Duration,
}

impl Default for VirshBackendConfig {
    fn default() -> Self {
        Self {
            virsh_bin: PathBuf::from("/usr/bin/virsh"),
            virt_install_bin: PathBuf::from("/usr/bin/virt-install"),
            qemu_img_bin: PathBuf::from("/usr/bin/qemu-img"),
            connect_uri: "qemu:///system".to_string(),
            image_dir: PathBuf::from("/var/lib/corral/images"),
            state_dir: PathBuf::from("/var/lib/corral/envs"),
            address_timeout: Duration::from_secs(120),
        }
    }
}

/// Backend over the libvirt command line tools.
pub struct VirshBackend {
    config: VirshBackendConfig,
    store: EnvStore,
}

impl VirshBackend {
    pub fn new(config: VirshBackendConfig) -> Self {
        let store = EnvStore::new(&config.state_dir);
        Self { config, store }
    }

    fn virsh(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.config.virsh_bin);
        command.arg("--connect").arg(&self.config.connect_uri);
        command.args(args);
        command
    }

    fn disk_path(&self, environment: &str, node: &str, index: usize) -> PathBuf {
        self.config
            .image_dir
            .join(format!("{}-disk{index}.qcow2", domain_name(environment, node)))
    }

    fn definition_path(&self, name: &str) -> PathBuf {
        self.config.state_dir.join(format!("{name}.xml"))
    }

    async fn define_network(
        &self,
        environment: &str,
        network: &Network,
        index: usize,
    ) -> Result<(), BackendError> {
        let name = network_name(environment, &network.name);
        let path = self.definition_path(&name);
        std::fs::write(&path, network_xml(environment, network, index))
            .map_err(|e| BackendError::new("materialize", format!("{}: {e}", path.display())))?;

        let path_arg = path.display().to_string();
        run("materialize", self.virsh(&["net-define", &path_arg])).await?;
        run("materialize", self.virsh(&["net-start", &name])).await?;
        debug!(network = %name, "Network defined");
        Ok(())
    }

    async fn define_domain(&self, environment: &str, node: &Node) -> Result<(), BackendError> {
        let domain = domain_name(environment, &node.name);

        for (index, disk) in node.disks.iter().enumerate() {
            let overlay = self.disk_path(environment, &node.name, index);
            let mut command = Command::new(&self.config.qemu_img_bin);
            command
                .arg("create")
                .arg("-f")
                .arg(disk.format.as_str())
                .arg("-b")
                .arg(&disk.base_image)
                .arg("-F")
                .arg(disk.format.as_str())
                .arg(&overlay);
            run("materialize", command).await?;
        }

        // virt-install renders the domain XML; virsh define registers it
        // without booting anything.
        let mut command = Command::new(&self.config.virt_install_bin);
        command
            .arg("--connect")
            .arg(&self.config.connect_uri)
            .arg("--name")
            .arg(&domain)
            .arg("--memory")
            .arg(node.memory_mib.to_string())
            .arg("--vcpus")
            .arg("1")
            .arg("--os-variant")
            .arg("generic")
            .arg("--import")
            .arg("--noautoconsole")
            .arg("--print-xml");
        for (index, disk) in node.disks.iter().enumerate() {
            let overlay = self.disk_path(environment, &node.name, index);
            command.arg("--disk").arg(format!(
                "path={},format={},bus=virtio",
                overlay.display(),
                disk.format.as_str()
            ));
        }
        for network in &node.networks {
            command.arg("--network").arg(format!(
                "network={},model=virtio",
                network_name(environment, network)
            ));
        }
        command.arg("--boot").arg(boot_line(node));
        command
            .arg("--graphics")
            .arg(if node.vnc { "vnc" } else { "none" });

        let xml = run("materialize", command).await?;
        let path = self.definition_path(&domain);
        std::fs::write(&path, xml)
            .map_err(|e| BackendError::new("materialize", format!("{}: {e}", path.display())))?;

        let path_arg = path.display().to_string();
        run("materialize", self.virsh(&["define", &path_arg])).await?;
        debug!(domain = %domain, "Domain defined");
        Ok(())
    }
}

#[async_trait]
impl Backend for VirshBackend {
    async fn materialize(&self, topology: Topology) -> Result<Environment, BackendError> {
        for dir in [&self.config.image_dir, &self.config.state_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| BackendError::new("materialize", format!("{}: {e}", dir.display())))?;
        }

        for (index, network) in topology.networks.iter().enumerate() {
            self.define_network(&topology.name, network, index).await?;
        }
        for node in &topology.nodes {
            self.define_domain(&topology.name, node).await?;
        }

        info!(
            environment = %topology.name,
            nodes = topology.nodes.len(),
            "Environment materialized"
        );
        Ok(Environment {
            name: topology.name.clone(),
            handle: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            topology,
        })
    }

    async fn load(&self, name: &str) -> Result<Option<Environment>, BackendError> {
        self.store
            .load(name)
            .map_err(|e| BackendError::new("load", e.to_string()))
    }

    async fn persist(&self, environment: &Environment) -> Result<(), BackendError> {
        self.store
            .save(environment)
            .map_err(|e| BackendError::new("persist", e.to_string()))
    }

    async fn start(
        &self,
        environment: &mut Environment,
        node: &str,
    ) -> Result<IpAddr, BackendError> {
        let domain = domain_name(&environment.name, node);
        run("start", self.virsh(&["start", &domain])).await?;

        // The address arrives with the DHCP lease, some time after boot.
        let deadline = tokio::time::Instant::now() + self.config.address_timeout;
        let address = loop {
            let output = run("start", self.virsh(&["domifaddr", &domain])).await?;
            if let Some(address) = parse_domifaddr(&output) {
                break address;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::new(
                    "start",
                    format!("{domain} did not report an address"),
                ));
            }
            tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
        };

        let entry = environment
            .topology
            .node_mut(node)
            .ok_or_else(|| BackendError::new("start", format!("unknown node {node}")))?;
        entry.address = Some(address);

        info!(node, address = %address, "Node started");
        Ok(address)
    }

    async fn reachable(&self, environment: &Environment, node: &str) -> bool {
        match environment.address_of(node) {
            Some(address) => tcp_ping(SocketAddr::new(address, SSH_PORT), PROBE_TIMEOUT).await,
            None => false,
        }
    }

    async fn snapshot(
        &self,
        environment: &Environment,
        node: &str,
        label: &str,
    ) -> Result<(), BackendError> {
        let domain = domain_name(&environment.name, node);
        run(
            "snapshot",
            self.virsh(&["snapshot-create-as", &domain, label]),
        )
        .await?;
        info!(node, label, "Snapshot taken");
        Ok(())
    }

    async fn destroy(&self, environment: &mut Environment) -> Result<(), BackendError> {
        let record = self
            .store
            .load(&environment.name)
            .map_err(|e| BackendError::new("destroy", e.to_string()))?;
        if record.is_none() && environment.handle.is_empty() {
            debug!(environment = %environment.name, "Already destroyed");
            return Ok(());
        }

        // Teardown keeps going past individual failures so a partially
        // built environment can still be cleaned up.
        for node in &environment.topology.nodes {
            let domain = domain_name(&environment.name, &node.name);
            if let Err(e) = run("destroy", self.virsh(&["destroy", &domain])).await {
                debug!(domain = %domain, error = %e, "Domain was not running");
            }
            if let Err(e) = run(
                "destroy",
                self.virsh(&["undefine", &domain, "--snapshots-metadata"]),
            )
            .await
            {
                warn!(domain = %domain, error = %e, "Could not undefine domain");
            }
            for index in 0..node.disks.len() {
                let overlay = self.disk_path(&environment.name, &node.name, index);
                std::fs::remove_file(overlay).ok();
            }
            std::fs::remove_file(self.definition_path(&domain)).ok();
        }

        for network in &environment.topology.networks {
            let name = network_name(&environment.name, &network.name);
            if let Err(e) = run("destroy", self.virsh(&["net-destroy", &name])).await {
                debug!(network = %name, error = %e, "Network was not active");
            }
            if let Err(e) = run("destroy", self.virsh(&["net-undefine", &name])).await {
                warn!(network = %name, error = %e, "Could not undefine network");
            }
            std::fs::remove_file(self.definition_path(&name)).ok();
        }

        self.store
            .remove(&environment.name)
            .map_err(|e| BackendError::new("destroy", e.to_string()))?;
        environment.handle.clear();
        for node in &mut environment.topology.nodes {
            node.address = None;
        }

        info!(environment = %environment.name, "Environment destroyed");
        Ok(())
    }
}

async fn run(op: &'static str, mut command: Command) -> Result<String, BackendError> {
    let rendered = render(command.as_std());
    debug!(command = %rendered, "Running");

    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BackendError::new(op, format!("{rendered}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::new(
            op,
            format!("{rendered} exited {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn render(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn domain_name(environment: &str, node: &str) -> String {
    format!("{environment}-{node}")
}

fn network_name(environment: &str, network: &str) -> String {
    format!("{environment}-{network}")
}

fn boot_line(node: &Node) -> String {
    node.boot
        .iter()
        .map(|device| device.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Libvirt network definition. Address-providing networks get a NAT
/// subnet with a DHCP range; the subnet is derived from the network's
/// position in the topology.
fn network_xml(environment: &str, network: &Network, index: usize) -> String {
    let name = network_name(environment, &network.name);
    if network.provides_addresses {
        let octet = 107 + index;
        format!(
            "<network>\n  <name>{name}</name>\n  <forward mode='nat'/>\n  \
             <ip address='10.{octet}.0.1' netmask='255.255.255.0'>\n    <dhcp>\n      \
             <range start='10.{octet}.0.2' end='10.{octet}.0.254'/>\n    </dhcp>\n  \
             </ip>\n</network>\n"
        )
    } else {
        format!("<network>\n  <name>{name}</name>\n</network>\n")
    }
}

/// First IPv4 address in `virsh domifaddr` output, if any.
fn parse_domifaddr(output: &str) -> Option<IpAddr> {
    for line in output.lines() {
        for token in line.split_whitespace() {
            let candidate = token.split('/').next().unwrap_or(token);
            if let Ok(address) = candidate.parse::<IpAddr>() {
                if address.is_ipv4() {
                    return Some(address);
                }
            }
        }
    }
    None
}
