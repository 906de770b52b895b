//! Bring-up error taxonomy.

use std::time::Duration;

use corral_remote::SessionError;
use corral_topology::TopologyError;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors that abort a bring-up run.
///
/// Every variant is fatal. The only retries in the system are the bounded
/// readiness polls, which surface here as `Timeout` once exhausted.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Static input cannot produce a valid cluster.
    #[error("invalid cluster configuration: {0}")]
    Config(#[from] TopologyError),

    /// A local template file could not be read.
    #[error("cannot read template {path}: {detail}")]
    Template { path: String, detail: String },

    /// The virtualization backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A bounded wait expired.
    #[error("node {node} timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        node: String,
        waiting_for: String,
        elapsed: Duration,
    },

    /// A remote step failed on a node.
    #[error("step {step} failed on node {node}: {source}")]
    Exec {
        node: String,
        step: &'static str,
        #[source]
        source: SessionError,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    pub(crate) fn exec(node: &str, step: &'static str, source: SessionError) -> Self {
        Self::Exec {
            node: node.to_string(),
            step,
            source,
        }
    }
}
