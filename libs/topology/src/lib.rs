//! # corral-topology
//!
//! Static cluster topology descriptions for corral test environments.
//!
//! ## Design Principles
//!
//! - Describing a topology is pure: no I/O, no backend resources allocated
//! - A described topology always has exactly one control node
//! - Runtime detail (node addresses) stays unset until a backend assigns it
//! - Descriptions are serializable so an environment record can embed them

mod spec;
mod types;

pub use spec::{describe, ClusterSpec};
pub use types::{
    BootDevice, DiskFormat, DiskSpec, Network, Node, NodeRole, Topology, TopologyError,
};
