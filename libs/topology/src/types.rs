//! Topology data model.
//!
//! A [`Topology`] describes which networks exist and which machines join
//! them. It carries no live backend state; each node's runtime address is
//! `None` until a backend starts the node and reports one.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topology construction and validation errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The cluster spec has no base image path.
    #[error("base image path is empty")]
    EmptyBaseImage,

    /// A node name appears more than once.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    /// The topology does not have exactly one control node.
    #[error("expected exactly one control node, found {0}")]
    ControlCount(usize),

    /// A node attaches to a network the topology does not define.
    #[error("node {node} attaches to unknown network {network}")]
    UnknownNetwork { node: String, network: String },
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Hosts the configuration-management server and signs trust requests.
    Control,

    /// Requests trust from the control node.
    Agent,
}

impl NodeRole {
    /// Canonical string form, used in logs and persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An isolated network segment nodes can attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,

    /// Whether the backend hands out addresses on this network.
    /// Reachability checks only make sense on networks that do.
    pub provides_addresses: bool,
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    Qcow2,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qcow2 => "qcow2",
        }
    }
}

/// One disk backed by a copy-on-write overlay of a base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Path to the base image the overlay is created from.
    pub base_image: PathBuf,

    pub format: DiskFormat,
}

/// Boot device kinds in firmware boot-order terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootDevice {
    Disk,
    Cdrom,
    Network,
}

impl BootDevice {
    /// Name libvirt-style tooling uses for this device.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disk => "hd",
            Self::Cdrom => "cdrom",
            Self::Network => "network",
        }
    }
}

/// One machine in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    pub role: NodeRole,

    /// Memory in MiB.
    pub memory_mib: u32,

    /// Networks this node attaches to, in interface order.
    pub networks: Vec<String>,

    pub disks: Vec<DiskSpec>,

    /// Boot device order.
    pub boot: Vec<BootDevice>,

    /// Whether the backend should expose a VNC console for this node.
    pub vnc: bool,

    /// Runtime address, assigned by the backend after the node starts.
    pub address: Option<IpAddr>,
}

/// Static description of a whole cluster: its networks and its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,

    pub networks: Vec<Network>,

    pub nodes: Vec<Node>,
}

impl Topology {
    /// Checks the structural invariants: unique node names, exactly one
    /// control node, and every attachment referencing a defined network.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateNode(node.name.clone()));
            }
            for network in &node.networks {
                if !self.networks.iter().any(|n| &n.name == network) {
                    return Err(TopologyError::UnknownNetwork {
                        node: node.name.clone(),
                        network: network.clone(),
                    });
                }
            }
        }

        let controls = self
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::Control)
            .count();
        if controls != 1 {
            return Err(TopologyError::ControlCount(controls));
        }

        Ok(())
    }

    /// The control node, if the topology has exactly one.
    pub fn control(&self) -> Option<&Node> {
        let mut controls = self.nodes.iter().filter(|n| n.role == NodeRole::Control);
        let first = controls.next()?;
        if controls.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Agent nodes in declaration order.
    pub fn agents(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Agent)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }
}
