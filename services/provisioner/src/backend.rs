//! Provisioning backend interface and mock implementation.
//!
//! A backend owns the translation from a static topology to live virtual
//! machines. The orchestrator only talks to this trait: materialize,
//! start, snapshot, destroy, plus load/persist of the environment record
//! so a later run can resume instead of rebuilding.
//!
//! A mock implementation is provided for testing and dry runs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use corral_topology::{Node, Topology};

/// Backend operation failure. The underlying cause is opaque to callers;
/// `op` names the operation that failed.
#[derive(Debug, Error)]
#[error("backend {op} failed: {detail}")]
pub struct BackendError {
    pub op: &'static str,
    pub detail: String,
}

impl BackendError {
    pub fn new(op: &'static str, detail: impl Into<String>) -> Self {
        Self {
            op,
            detail: detail.into(),
        }
    }
}

/// A materialized topology bound to live backend resources.
///
/// Owned by the orchestrator for the duration of a run. The persisted
/// record is written once, right after materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment name; the key for load and persist.
    pub name: String,

    /// Opaque backend handle for this materialization.
    pub handle: String,

    pub created_at: DateTime<Utc>,

    pub topology: Topology,
}

impl Environment {
    pub fn control(&self) -> Option<&Node> {
        self.topology.control()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Node> {
        self.topology.agents()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.topology.node(name)
    }

    /// Runtime address of a node, once the backend assigned one.
    pub fn address_of(&self, name: &str) -> Option<IpAddr> {
        self.topology.node(name).and_then(|n| n.address)
    }
}

/// Virtualization backend interface.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Allocates backend resources for every network and node in the
    /// topology. No node is running afterwards.
    async fn materialize(&self, topology: Topology) -> Result<Environment, BackendError>;

    /// Loads a previously persisted environment record, `None` if there
    /// is no record under that name.
    async fn load(&self, name: &str) -> Result<Option<Environment>, BackendError>;

    /// Persists the environment record for a later `load`.
    async fn persist(&self, environment: &Environment) -> Result<(), BackendError>;

    /// Boots one node and returns its runtime address. The address is
    /// also written into the environment's topology.
    async fn start(
        &self,
        environment: &mut Environment,
        node: &str,
    ) -> Result<IpAddr, BackendError>;

    /// Whether the node currently accepts connections on its service
    /// port. Probe semantics: any failure reads as "not reachable yet".
    /// The bounded reachability wait after start polls this.
    async fn reachable(&self, environment: &Environment, node: &str) -> bool;

    /// Takes a named restorable checkpoint of one node.
    async fn snapshot(
        &self,
        environment: &Environment,
        node: &str,
        label: &str,
    ) -> Result<(), BackendError>;

    /// Releases everything the environment holds, including the persisted
    /// record. Idempotent: destroying an environment that is already gone
    /// is a no-op.
    async fn destroy(&self, environment: &mut Environment) -> Result<(), BackendError>;
}

#[derive(Debug, Default)]
struct MockState {
    materialized: u32,
    next_octet: u8,
    started: Vec<String>,
    snapshots: Vec<(String, String)>,
    records: HashMap<String, Environment>,
    destroys: u32,
    fail_materialize: bool,
    fail_start_of: Option<String>,
    fail_snapshot_of: Option<String>,
    unreachable: Option<String>,
}

fn lock(mutex: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock backend for tests and dry runs.
///
/// Assigns addresses from 10.107.0.0/24 in start order and keeps records
/// in memory. Failure knobs let tests abort a run at a chosen operation.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `materialize` fail.
    pub fn fail_materialize(&self) {
        lock(&self.state).fail_materialize = true;
    }

    /// Makes `start` fail for one node.
    pub fn fail_start_of(&self, node: impl Into<String>) {
        lock(&self.state).fail_start_of = Some(node.into());
    }

    /// Makes `snapshot` fail for one node.
    pub fn fail_snapshot_of(&self, node: impl Into<String>) {
        lock(&self.state).fail_snapshot_of = Some(node.into());
    }

    /// Makes `reachable` report false for one node.
    pub fn mark_unreachable(&self, node: impl Into<String>) {
        lock(&self.state).unreachable = Some(node.into());
    }

    /// Nodes started so far, in order.
    pub fn started_nodes(&self) -> Vec<String> {
        lock(&self.state).started.clone()
    }

    /// Snapshots taken so far, as (node, label) in order.
    pub fn snapshots(&self) -> Vec<(String, String)> {
        lock(&self.state).snapshots.clone()
    }

    /// How many times `destroy` released live resources.
    pub fn destroy_count(&self) -> u32 {
        lock(&self.state).destroys
    }

    /// The persisted record under `name`, if any.
    pub fn record(&self, name: &str) -> Option<Environment> {
        lock(&self.state).records.get(name).cloned()
    }

    /// Seeds a persisted record, as if a previous run had materialized it.
    pub fn seed_record(&self, environment: Environment) {
        lock(&self.state)
            .records
            .insert(environment.name.clone(), environment);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn materialize(&self, topology: Topology) -> Result<Environment, BackendError> {
        let mut state = lock(&self.state);
        if state.fail_materialize {
            return Err(BackendError::new("materialize", "mock failure"));
        }
        state.materialized += 1;
        let handle = format!("mock-{:04x}", state.materialized);
        info!(
            environment = %topology.name,
            nodes = topology.nodes.len(),
            "[MOCK] Materialized environment"
        );
        Ok(Environment {
            name: topology.name.clone(),
            handle,
            created_at: Utc::now(),
            topology,
        })
    }

    async fn load(&self, name: &str) -> Result<Option<Environment>, BackendError> {
        Ok(lock(&self.state).records.get(name).cloned())
    }

    async fn persist(&self, environment: &Environment) -> Result<(), BackendError> {
        lock(&self.state)
            .records
            .insert(environment.name.clone(), environment.clone());
        debug!(environment = %environment.name, "[MOCK] Persisted record");
        Ok(())
    }

    async fn start(
        &self,
        environment: &mut Environment,
        node: &str,
    ) -> Result<IpAddr, BackendError> {
        let mut state = lock(&self.state);
        if state.fail_start_of.as_deref() == Some(node) {
            return Err(BackendError::new("start", format!("mock failure for {node}")));
        }

        state.next_octet += 1;
        let addr = IpAddr::from([10, 107, 0, state.next_octet]);
        state.started.push(node.to_string());
        drop(state);

        let entry = environment
            .topology
            .node_mut(node)
            .ok_or_else(|| BackendError::new("start", format!("unknown node {node}")))?;
        entry.address = Some(addr);

        info!(node, address = %addr, "[MOCK] Started node");
        Ok(addr)
    }

    async fn reachable(&self, _environment: &Environment, node: &str) -> bool {
        lock(&self.state).unreachable.as_deref() != Some(node)
    }

    async fn snapshot(
        &self,
        _environment: &Environment,
        node: &str,
        label: &str,
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.fail_snapshot_of.as_deref() == Some(node) {
            return Err(BackendError::new(
                "snapshot",
                format!("mock failure for {node}"),
            ));
        }
        state.snapshots.push((node.to_string(), label.to_string()));
        info!(node, label, "[MOCK] Snapshot taken");
        Ok(())
    }

    async fn destroy(&self, environment: &mut Environment) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.records.remove(&environment.name).is_none() && environment.handle.is_empty() {
            debug!(environment = %environment.name, "[MOCK] Already destroyed");
            return Ok(());
        }
        state.destroys += 1;
        environment.handle.clear();
        for node in &mut environment.topology.nodes {
            node.address = None;
        }
        info!(environment = %environment.name, "[MOCK] Destroyed environment");
        Ok(())
    }
}
