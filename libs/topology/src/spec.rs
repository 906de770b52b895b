//! Cluster sizing policy and the describe step.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{
    BootDevice, DiskFormat, DiskSpec, Network, Node, NodeRole, Topology, TopologyError,
};

/// Name given to the control node.
pub const CONTROL_NODE_NAME: &str = "control";

/// Sizing and naming policy a topology is described from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Environment name; also the persisted record key.
    pub name: String,

    /// Base image every node's disk overlay is created from.
    pub base_image: PathBuf,

    /// Number of agent nodes. The control node is always added on top.
    pub agent_count: u32,

    /// Memory per node in MiB.
    pub memory_mib: u32,

    /// Expose a VNC console per node.
    pub vnc: bool,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: "recipes".to_string(),
            base_image: PathBuf::new(),
            agent_count: 4,
            memory_mib: 1024,
            vnc: true,
        }
    }
}

/// Expands a [`ClusterSpec`] into a full [`Topology`].
///
/// Pure and deterministic. Every node joins all three stock networks and
/// boots from a qcow2 overlay of the base image. Fails before any backend
/// is involved if the spec cannot produce a valid topology.
pub fn describe(spec: &ClusterSpec) -> Result<Topology, TopologyError> {
    if spec.base_image.as_os_str().is_empty() {
        return Err(TopologyError::EmptyBaseImage);
    }

    let networks = vec![
        Network {
            name: "internal".to_string(),
            provides_addresses: true,
        },
        Network {
            name: "private".to_string(),
            provides_addresses: false,
        },
        Network {
            name: "public".to_string(),
            provides_addresses: true,
        },
    ];

    let mut nodes = Vec::with_capacity(spec.agent_count as usize + 1);
    nodes.push(node_for(spec, CONTROL_NODE_NAME, NodeRole::Control, &networks));
    for i in 1..=spec.agent_count {
        let name = format!("agent-{i:02}");
        nodes.push(node_for(spec, &name, NodeRole::Agent, &networks));
    }

    let topology = Topology {
        name: spec.name.clone(),
        networks,
        nodes,
    };
    topology.validate()?;
    Ok(topology)
}

fn node_for(spec: &ClusterSpec, name: &str, role: NodeRole, networks: &[Network]) -> Node {
    Node {
        name: name.to_string(),
        role,
        memory_mib: spec.memory_mib,
        networks: networks.iter().map(|n| n.name.clone()).collect(),
        disks: vec![DiskSpec {
            base_image: spec.base_image.clone(),
            format: DiskFormat::Qcow2,
        }],
        boot: vec![BootDevice::Disk],
        vnc: spec.vnc,
        address: None,
    }
}
