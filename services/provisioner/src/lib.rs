//! Corral Provisioner Library
//!
//! Builds multi-node virtual test clusters: describe a topology, have a
//! backend materialize and boot it, wait for every node to accept ssh,
//! push per-role configuration, drive the certificate handshake, and
//! checkpoint the result so tests start from a clean snapshot.
//!
//! ## Modules
//!
//! - `backend`: backend trait, environment record, mock implementation
//! - `virsh`: real backend over the libvirt command line tools
//! - `configure`: per-role remote configuration steps
//! - `bringup`: phase machine and orchestrator
//! - `store`: environment record persistence
//! - `depot`: HTTP artifact depot
//! - `config`: env-driven configuration

pub mod backend;
pub mod bringup;
pub mod config;
pub mod configure;
pub mod depot;
pub mod error;
pub mod store;
pub mod virsh;

// Re-export commonly used types
pub use backend::{Backend, BackendError, Environment, MockBackend};
pub use bringup::{BringUpFailure, BringUpReport, NodeReport, Orchestrator, Phase};
pub use config::{BackendKind, BringUpConfig, Config};
pub use error::ProvisionError;
