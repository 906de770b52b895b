//! End-to-end bring-up test.
//!
//! Drives the complete cluster lifecycle over the in-memory backend and
//! scripted sessions, verifying:
//!
//! 1. Describe and materialize the default topology
//! 2. Boot order and reachability
//! 3. Hostname and /etc/hosts wiring
//! 4. Control and agent configuration
//! 5. Certificate exchange (one signing round, per-agent acknowledgment)
//! 6. Snapshots of every node
//! 7. Adoption of the persisted record on a second run
//! 8. Idempotent teardown
//!
//! ## Running
//!
//! ```bash
//! cargo test -p corral-e2e --test bring_up
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use corral_provisioner::configure::RoleConfigurator;
use corral_provisioner::depot::Depot;
use corral_provisioner::{
    Backend, BringUpConfig, MockBackend, Orchestrator, Phase, ProvisionError,
};
use corral_readiness::WaitPolicy;
use corral_remote::{ScriptedFactory, SessionFactory, SshAuth};
use corral_topology::ClusterSpec;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,corral_provisioner=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Path of a config template shipped with the repository.
fn shipped_template(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../config")
        .join(name)
}

fn cluster_config(agents: u32, state_dir: &Path) -> BringUpConfig {
    let policy = WaitPolicy::new(Duration::from_secs(1), Duration::from_millis(10));
    BringUpConfig {
        cluster: ClusterSpec {
            base_image: PathBuf::from("/srv/images/centos63.qcow2"),
            agent_count: agents,
            ..ClusterSpec::default()
        },
        auth: SshAuth::password("root", "r00tme"),
        reach_policy: policy,
        cert_policy: policy,
        control_template_path: shipped_template("puppet.master.conf"),
        agent_template_path: shipped_template("puppet.agent.conf"),
        peer_hosts_on_control: true,
        snapshot_label: "empty".to_string(),
        state_dir: state_dir.to_path_buf(),
    }
}

/// The mock backend hands addresses out in boot order, control first.
fn node_addr(last: u8) -> IpAddr {
    IpAddr::from([10, 107, 0, last])
}

/// E2E happy path covering the complete environment lifecycle.
///
/// This test validates:
/// - The default topology (one control node, four agents)
/// - Per-node configuration command sequences
/// - The single signing round and per-agent acknowledgment
/// - Snapshot labels
/// - Record adoption on a second run
/// - Idempotent destroy
#[tokio::test]
async fn e2e_happy_path_bring_up_to_snapshot() {
    init_tracing();

    let state = tempfile::tempdir().unwrap();
    let config = cluster_config(4, state.path());

    let backend = Arc::new(MockBackend::new());
    let sessions = Arc::new(ScriptedFactory::new());
    let mut orchestrator = Orchestrator::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&sessions) as Arc<dyn SessionFactory>,
        config.clone(),
    );

    // ===========================================================================
    // Step 1: Bring the default five node cluster up
    // ===========================================================================
    let report = orchestrator.ensure_environment().await.unwrap();
    assert_eq!(report.environment, "recipes");
    assert_eq!(report.phase, Phase::Snapshotted);
    assert!(!report.resumed);
    assert_eq!(report.nodes.len(), 5);
    assert!(report.nodes.iter().all(|n| n.address.is_some()));

    assert_eq!(
        backend.started_nodes(),
        ["control", "agent-01", "agent-02", "agent-03", "agent-04"]
    );

    // ===========================================================================
    // Step 2: Control node commands and config
    // ===========================================================================
    let control = node_addr(1);
    let control_commands = sessions.commands_on(control);
    assert!(control_commands.contains(&"hostname control".to_string()));
    assert!(control_commands.contains(&"yum -y install puppet-server".to_string()));
    assert!(control_commands.contains(&"iptables -F".to_string()));
    // Peers were published on the control node before the server came up.
    assert!(
        control_commands.contains(&"echo 10.107.0.2 agent-01 agent-01 >> /etc/hosts".to_string())
    );

    let control_files = sessions.files_written_on(control);
    assert_eq!(control_files.len(), 1);
    assert_eq!(control_files[0].0, "/etc/puppet/puppet.conf");
    assert!(control_files[0].1.contains("certname = control"));

    // ===========================================================================
    // Step 3: Agent commands and config
    // ===========================================================================
    for (i, name) in ["agent-01", "agent-02", "agent-03", "agent-04"]
        .iter()
        .enumerate()
    {
        let addr = node_addr(i as u8 + 2);
        let commands = sessions.commands_on(addr);
        assert!(commands.contains(&format!("hostname {name}")), "{name}");
        assert!(
            commands.contains(&"yum -y install puppet".to_string()),
            "{name}"
        );
        assert!(
            commands.contains(&"echo 10.107.0.1 control control >> /etc/hosts".to_string()),
            "{name}"
        );

        let files = sessions.files_written_on(addr);
        assert!(
            files.iter().any(|(path, content)| {
                path == "/etc/puppet/puppet.conf" && content.contains("server = control")
            }),
            "{name}"
        );
    }

    // ===========================================================================
    // Step 4: Certificate exchange invariants
    // ===========================================================================
    // One signing round, no matter how many agents.
    assert_eq!(sessions.command_count_containing("cert sign --all"), 1);
    // Each agent requested at configure time and acknowledged once signed.
    assert_eq!(sessions.command_count_containing("--waitforcert 0"), 8);

    // ===========================================================================
    // Step 5: Snapshots
    // ===========================================================================
    let snapshots = backend.snapshots();
    assert_eq!(snapshots.len(), 5);
    assert_eq!(snapshots[0].0, "control");
    assert!(snapshots.iter().all(|(_, label)| label == "empty"));

    // ===========================================================================
    // Step 6: A second run adopts the persisted record
    // ===========================================================================
    let adopted_sessions = Arc::new(ScriptedFactory::new());
    let mut second = Orchestrator::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&adopted_sessions) as Arc<dyn SessionFactory>,
        config,
    );
    let adopted = second.ensure_environment().await.unwrap();
    assert!(adopted.resumed);
    assert_eq!(adopted.phase, Phase::Materialized);
    assert_eq!(adopted.nodes.len(), 5);
    // The record captures materialization, before any address assignment.
    assert!(adopted.nodes.iter().all(|n| n.address.is_none()));
    // Adoption builds nothing and talks to no node.
    assert_eq!(backend.started_nodes().len(), 5);
    assert!(adopted_sessions.calls().is_empty());

    // ===========================================================================
    // Step 7: Destroy, then destroy again
    // ===========================================================================
    second.destroy().await.unwrap();
    assert_eq!(backend.destroy_count(), 1);
    assert!(backend.record("recipes").is_none());

    second.destroy().await.unwrap();
    assert_eq!(backend.destroy_count(), 1);

    println!("E2E bring-up completed");
    println!("  Environment: {}", report.environment);
    println!("  Nodes: {}", report.nodes.len());
    println!("  Snapshots: {}", snapshots.len());
}

/// A failing agent step aborts the run before any signing; the partially
/// built environment still tears down.
#[tokio::test]
async fn e2e_failed_agent_aborts_before_signing() {
    init_tracing();

    let state = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let sessions = Arc::new(ScriptedFactory::new());
    // agent-03 is the fourth node to boot, so it answers on .4.
    sessions.fail_writes_to_on("/etc/puppet/puppet.conf", node_addr(4));

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&sessions) as Arc<dyn SessionFactory>,
        cluster_config(4, state.path()),
    );

    let failure = orchestrator.ensure_environment().await.unwrap_err();
    assert_eq!(failure.reached, Phase::ControlConfigured);
    assert_eq!(orchestrator.phase(), Phase::Failed);
    match failure.source {
        ProvisionError::Exec { node, step, .. } => {
            assert_eq!(node, "agent-03");
            assert_eq!(step, "configure-agent");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Agents before the failing one got through their configuration;
    // the one after it was never touched, and signing never happened.
    assert!(sessions
        .files_written_on(node_addr(3))
        .iter()
        .any(|(path, _)| path == "/etc/puppet/puppet.conf"));
    assert!(sessions.files_written_on(node_addr(5)).is_empty());
    assert!(!sessions
        .commands_on(node_addr(5))
        .contains(&"yum -y install puppet".to_string()));
    assert_eq!(sessions.command_count_containing("cert sign --all"), 0);
    assert!(backend.snapshots().is_empty());

    // The partially built environment still tears down cleanly.
    orchestrator.destroy().await.unwrap();
    assert_eq!(backend.destroy_count(), 1);
    assert!(backend.record("recipes").is_none());
}

/// The depot serves artifacts over HTTP and nodes register it as a
/// package repository.
#[tokio::test]
async fn e2e_depot_backs_the_artifact_repository() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("Packages")).unwrap();
    std::fs::write(
        dir.path().join("Packages/corral-smoke-0.1.noarch.rpm"),
        b"rpm bytes",
    )
    .unwrap();

    let depot = Depot::serve(dir.path(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    // Nodes pull artifacts over plain HTTP.
    let fetched = reqwest::get(format!("{}Packages/corral-smoke-0.1.noarch.rpm", depot.url()))
        .await
        .unwrap();
    assert_eq!(fetched.status(), 200);
    assert_eq!(fetched.bytes().await.unwrap().as_ref(), b"rpm bytes");

    // A node points its package manager at the depot.
    let sessions = ScriptedFactory::new();
    let node = node_addr(2);
    let session = sessions
        .connect(node, &SshAuth::password("root", "r00tme"))
        .await
        .unwrap();
    let configurator = RoleConfigurator::new(String::new(), String::new());
    configurator
        .register_artifact_repository(session.as_ref(), &depot.url())
        .await
        .unwrap();

    let files = sessions.files_written_on(node);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "/etc/yum.repos.d/corral.repo");
    assert!(files[0].1.contains(&format!("baseurl={}", depot.url())));
    assert_eq!(sessions.commands_on(node), ["yum makecache"]);

    depot.stop().await;
}
