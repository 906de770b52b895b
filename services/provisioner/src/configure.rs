//! Role configuration steps.
//!
//! Everything the cluster nodes actually run lives here as opaque command
//! strings; the orchestrator only sequences these calls. Steps are
//! fire-and-check: any non-zero exit aborts, except where noted.

use std::net::IpAddr;

use corral_readiness::{wait_until, WaitError, WaitPolicy};
use corral_remote::{RemoteSession, SessionError};
use tracing::{debug, info};

const PACKAGE_REPO_RPM: &str =
    "http://yum.puppetlabs.com/el/6/products/i386/puppetlabs-release-6-5.noarch.rpm";
const EXTRA_REPO_RPM: &str =
    "http://download.fedoraproject.org/pub/epel/6/x86_64/epel-release-6-7.noarch.rpm";
const EXTRA_REPO_PACKAGE: &str = "epel-release";

const SERVER_CONF_PATH: &str = "/etc/puppet/puppet.conf";
const ARTIFACT_REPO_PATH: &str = "/etc/yum.repos.d/corral.repo";

/// Submits the node's certificate request to the control node. Exits
/// non-zero until the certificate has been signed.
const REQUEST_CERTIFICATE: &str = "puppet agent --waitforcert 0";

const SIGN_ALL_CERTIFICATES: &str = "puppet cert sign --all";
const START_SERVER: &str = "puppet resource service puppetmaster ensure=running enable=true";
const START_AGENT: &str = "puppet resource service puppet ensure=running enable=true";

/// A peer entry for /etc/hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHost {
    pub name: String,
    pub address: IpAddr,
}

/// Remote configuration steps for cluster roles.
///
/// Holds the config file contents verbatim; templates are opaque blobs
/// written to the nodes as-is.
pub struct RoleConfigurator {
    control_config: String,
    agent_config: String,
}

impl RoleConfigurator {
    pub fn new(control_config: String, agent_config: String) -> Self {
        Self {
            control_config,
            agent_config,
        }
    }

    /// Sets the node's hostname and gives it a loopback alias for itself.
    pub async fn rename(&self, session: &dyn RemoteSession, name: &str) -> Result<(), SessionError> {
        session.execute_privileged(&format!("hostname {name}")).await?;
        self.add_host_entry(session, "127.0.0.1", name).await?;
        info!(node = name, "Renamed node");
        Ok(())
    }

    async fn add_host_entry(
        &self,
        session: &dyn RemoteSession,
        address: &str,
        name: &str,
    ) -> Result<(), SessionError> {
        session
            .execute_privileged(&format!("echo {address} {name} {name} >> /etc/hosts"))
            .await?;
        Ok(())
    }

    /// Appends a hosts entry for every peer, so nodes resolve each other
    /// by name before any name service exists.
    pub async fn add_peer_hosts(
        &self,
        session: &dyn RemoteSession,
        peers: &[PeerHost],
    ) -> Result<(), SessionError> {
        for peer in peers {
            self.add_host_entry(session, &peer.address.to_string(), &peer.name)
                .await?;
        }
        Ok(())
    }

    /// Turns the node into the configuration-management server: package
    /// repository, server package, open firewall, config file, service.
    pub async fn configure_control(&self, session: &dyn RemoteSession) -> Result<(), SessionError> {
        self.add_package_repository(session).await?;
        session.execute_privileged("yum -y install puppet-server").await?;
        session.execute_privileged("iptables -F").await?;
        session
            .write_file(SERVER_CONF_PATH, &self.control_config)
            .await?;
        session.execute_privileged(START_SERVER).await?;
        info!("Control node configured");
        Ok(())
    }

    /// Turns the node into an agent: peer hosts, package repository,
    /// client package, config file, certificate request, agent service.
    pub async fn configure_agent(
        &self,
        session: &dyn RemoteSession,
        name: &str,
        peers: &[PeerHost],
    ) -> Result<(), SessionError> {
        self.add_peer_hosts(session, peers).await?;
        self.add_package_repository(session).await?;
        session.execute_privileged("yum -y install puppet").await?;
        session.write_file(SERVER_CONF_PATH, &self.agent_config).await?;

        match session.execute_privileged(REQUEST_CERTIFICATE).await {
            Ok(_) => {}
            // The request run reports failure until the certificate is
            // signed; the request itself has still been submitted.
            Err(SessionError::CommandFailed { .. }) => {
                debug!(node = name, "Certificate not signed yet");
            }
            Err(e) => return Err(e),
        }
        session.execute_privileged(START_AGENT).await?;

        self.trust_extra_repository(session).await?;
        info!(node = name, "Agent node configured");
        Ok(())
    }

    async fn add_package_repository(&self, session: &dyn RemoteSession) -> Result<(), SessionError> {
        session
            .execute_privileged(&format!("rpm -ivh {PACKAGE_REPO_RPM}"))
            .await?;
        Ok(())
    }

    /// Signs every pending certificate request on the control node.
    /// Must run exactly once per bring-up, after all agents are configured.
    pub async fn sign_all_certificates(
        &self,
        session: &dyn RemoteSession,
    ) -> Result<(), SessionError> {
        session.execute_privileged(SIGN_ALL_CERTIFICATES).await?;
        info!("Signed all pending certificate requests");
        Ok(())
    }

    /// Waits until the agent can complete a run with its signed
    /// certificate. Bounded by `policy`.
    pub async fn await_certificate(
        &self,
        session: &dyn RemoteSession,
        name: &str,
        policy: WaitPolicy,
    ) -> Result<(), WaitError> {
        wait_until(name, policy, || async move {
            session.execute_privileged(REQUEST_CERTIFICATE).await.is_ok()
        })
        .await?;
        info!(node = name, "Certificate acknowledged");
        Ok(())
    }

    /// Registers the extra package repository. Guarded, so re-running on
    /// a node that already trusts it is a no-op.
    pub async fn trust_extra_repository(
        &self,
        session: &dyn RemoteSession,
    ) -> Result<(), SessionError> {
        session
            .execute_privileged(&format!(
                "rpm -q {EXTRA_REPO_PACKAGE} || rpm -Uvh {EXTRA_REPO_RPM}"
            ))
            .await?;
        Ok(())
    }

    /// Points the node at an artifact depot and refreshes package metadata.
    pub async fn register_artifact_repository(
        &self,
        session: &dyn RemoteSession,
        base_url: &str,
    ) -> Result<(), SessionError> {
        session
            .write_file(ARTIFACT_REPO_PATH, &repo_stanza(base_url))
            .await?;
        session.execute_privileged("yum makecache").await?;
        info!(url = base_url, "Artifact repository registered");
        Ok(())
    }
}

/// Yum repository stanza pointing at an artifact depot.
pub fn repo_stanza(base_url: &str) -> String {
    format!(
        "[corral]\n\
         name=Corral artifact repository\n\
         baseurl={base_url}\n\
         enabled=1\n\
         gpgcheck=0\n"
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use corral_remote::{ScriptedFactory, SessionFactory, SshAuth};

    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 107, 0, last])
    }

    fn auth() -> SshAuth {
        SshAuth::password("root", "r00tme")
    }

    fn configurator() -> RoleConfigurator {
        RoleConfigurator::new(
            "[main]\nserver: control\n".to_string(),
            "[agent]\nserver = control\n".to_string(),
        )
    }

    #[tokio::test]
    async fn test_rename_commands() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(1), &auth()).await.unwrap();

        configurator().rename(session.as_ref(), "control").await.unwrap();

        assert_eq!(
            factory.commands_on(addr(1)),
            [
                "hostname control",
                "echo 127.0.0.1 control control >> /etc/hosts",
            ]
        );
    }

    #[tokio::test]
    async fn test_configure_control_order() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(1), &auth()).await.unwrap();

        configurator().configure_control(session.as_ref()).await.unwrap();

        let commands = factory.commands_on(addr(1));
        assert_eq!(commands[0], format!("rpm -ivh {PACKAGE_REPO_RPM}"));
        assert_eq!(commands[1], "yum -y install puppet-server");
        assert_eq!(commands[2], "iptables -F");
        assert_eq!(commands[3], START_SERVER);

        let files = factory.files_written_on(addr(1));
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, SERVER_CONF_PATH);
        assert!(files[0].1.contains("server: control"));
    }

    #[tokio::test]
    async fn test_configure_agent_order_and_peers() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(2), &auth()).await.unwrap();

        let peers = vec![
            PeerHost {
                name: "control".to_string(),
                address: addr(1),
            },
            PeerHost {
                name: "agent-01".to_string(),
                address: addr(2),
            },
        ];
        configurator()
            .configure_agent(session.as_ref(), "agent-01", &peers)
            .await
            .unwrap();

        let commands = factory.commands_on(addr(2));
        assert_eq!(
            commands[0],
            "echo 10.107.0.1 control control >> /etc/hosts"
        );
        assert_eq!(
            commands[1],
            "echo 10.107.0.2 agent-01 agent-01 >> /etc/hosts"
        );
        assert_eq!(commands[2], format!("rpm -ivh {PACKAGE_REPO_RPM}"));
        assert_eq!(commands[3], "yum -y install puppet");
        assert_eq!(commands[4], REQUEST_CERTIFICATE);
        assert_eq!(commands[5], START_AGENT);
        assert!(commands[6].contains(EXTRA_REPO_PACKAGE));

        let files = factory.files_written_on(addr(2));
        assert_eq!(files[0].0, SERVER_CONF_PATH);
    }

    #[tokio::test]
    async fn test_configure_agent_tolerates_unsigned_certificate() {
        let factory = ScriptedFactory::new();
        factory.fail_commands_containing("--waitforcert 0");
        let session = factory.connect(addr(2), &auth()).await.unwrap();

        // The request run fails until signing happens; configuration
        // continues regardless.
        configurator()
            .configure_agent(session.as_ref(), "agent-01", &[])
            .await
            .unwrap();

        let commands = factory.commands_on(addr(2));
        assert!(commands.contains(&START_AGENT.to_string()));
    }

    #[tokio::test]
    async fn test_configure_control_aborts_on_config_write_failure() {
        let factory = ScriptedFactory::new();
        factory.fail_writes_to(SERVER_CONF_PATH);
        let session = factory.connect(addr(1), &auth()).await.unwrap();

        let err = configurator()
            .configure_control(session.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CommandFailed { .. }));

        // The server was never started.
        let commands = factory.commands_on(addr(1));
        assert!(!commands.contains(&START_SERVER.to_string()));
    }

    #[tokio::test]
    async fn test_configure_agent_aborts_on_install_failure() {
        let factory = ScriptedFactory::new();
        factory.fail_commands_containing("yum -y install puppet");
        let session = factory.connect(addr(2), &auth()).await.unwrap();

        let err = configurator()
            .configure_agent(session.as_ref(), "agent-01", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CommandFailed { .. }));

        // Nothing after the failing step ran.
        let commands = factory.commands_on(addr(2));
        assert!(!commands.contains(&START_AGENT.to_string()));
    }

    #[tokio::test]
    async fn test_sign_all_command() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(1), &auth()).await.unwrap();

        configurator()
            .sign_all_certificates(session.as_ref())
            .await
            .unwrap();

        assert_eq!(factory.command_count_containing("cert sign --all"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_certificate_times_out_when_never_signed() {
        let factory = ScriptedFactory::new();
        factory.fail_commands_containing("--waitforcert 0");
        let session = factory.connect(addr(2), &auth()).await.unwrap();

        let policy = WaitPolicy::new(Duration::from_secs(30), Duration::from_secs(5));
        let result = configurator()
            .await_certificate(session.as_ref(), "agent-01", policy)
            .await;

        assert!(matches!(result, Err(WaitError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_await_certificate_succeeds_once_signed() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(2), &auth()).await.unwrap();

        let policy = WaitPolicy::new(Duration::from_secs(30), Duration::from_secs(5));
        configurator()
            .await_certificate(session.as_ref(), "agent-01", policy)
            .await
            .unwrap();

        assert_eq!(factory.command_count_containing("--waitforcert 0"), 1);
    }

    #[tokio::test]
    async fn test_trust_extra_repository_is_guarded() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(1), &auth()).await.unwrap();

        configurator()
            .trust_extra_repository(session.as_ref())
            .await
            .unwrap();

        let commands = factory.commands_on(addr(1));
        assert_eq!(
            commands[0],
            format!("rpm -q {EXTRA_REPO_PACKAGE} || rpm -Uvh {EXTRA_REPO_RPM}")
        );
    }

    #[tokio::test]
    async fn test_register_artifact_repository() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(3), &auth()).await.unwrap();

        configurator()
            .register_artifact_repository(session.as_ref(), "http://10.107.0.1:8000/")
            .await
            .unwrap();

        let files = factory.files_written_on(addr(3));
        assert_eq!(files[0].0, ARTIFACT_REPO_PATH);
        assert!(files[0].1.contains("baseurl=http://10.107.0.1:8000/"));
        assert!(files[0].1.contains("gpgcheck=0"));

        assert_eq!(factory.commands_on(addr(3)), ["yum makecache"]);
    }

    #[test]
    fn test_repo_stanza_shape() {
        let stanza = repo_stanza("http://192.0.2.7:8080/");
        assert!(stanza.starts_with("[corral]\n"));
        assert!(stanza.contains("baseurl=http://192.0.2.7:8080/\n"));
        assert!(stanza.ends_with("gpgcheck=0\n"));
    }
}
