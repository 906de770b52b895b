//! Session traits, authentication material, and the scripted test double.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Credentials used to open sessions.
#[derive(Debug, Clone)]
pub struct SshAuth {
    pub username: String,

    /// Password for password authentication.
    pub password: Option<String>,

    /// Identity file for key authentication.
    pub identity_file: Option<PathBuf>,
}

impl SshAuth {
    /// Password-based credentials.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            identity_file: None,
        }
    }

    /// Key-based credentials.
    pub fn identity(username: impl Into<String>, identity_file: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            password: None,
            identity_file: Some(identity_file.into()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.username == "root"
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The node did not accept a session.
    #[error("cannot open session to {addr}: {detail}")]
    Connect { addr: IpAddr, detail: String },

    /// A remote command exited non-zero.
    #[error("command `{command}` on {host} exited with {exit_code}: {stderr}")]
    CommandFailed {
        host: IpAddr,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The transport itself failed before the command could report an exit.
    #[error("transport failure on {host}: {detail}")]
    Transport { host: IpAddr, detail: String },
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live shell session bound to one node address.
///
/// Obtained through a [`SessionFactory`]. Commands are independent; the
/// session keeps no shell state between them. Non-zero exit is reported as
/// [`SessionError::CommandFailed`], so callers chain steps with `?`.
#[async_trait]
pub trait RemoteSession: std::fmt::Debug + Send + Sync {
    /// Runs a command as the session user.
    async fn execute(&self, command: &str) -> Result<ExecOutput, SessionError>;

    /// Runs a command with elevated privileges.
    async fn execute_privileged(&self, command: &str) -> Result<ExecOutput, SessionError>;

    /// Replaces the file at `path` with `content`.
    ///
    /// The write runs with elevated privileges so system paths work.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SessionError>;
}

/// Opens sessions to node addresses.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Probes the node and returns a session bound to `addr`.
    ///
    /// The probe runs a no-op command, so an unreachable or unauthenticated
    /// node fails here rather than on its first real step.
    async fn connect(
        &self,
        addr: IpAddr,
        auth: &SshAuth,
    ) -> Result<Box<dyn RemoteSession>, SessionError>;
}

/// One recorded interaction with a scripted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedCall {
    Connect {
        host: IpAddr,
    },
    Exec {
        host: IpAddr,
        command: String,
        privileged: bool,
    },
    WriteFile {
        host: IpAddr,
        path: String,
        content: String,
    },
}

#[derive(Debug)]
struct FailRule {
    substring: String,
    /// None fails the command on every host.
    host: Option<IpAddr>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    calls: Mutex<Vec<ScriptedCall>>,
    refuse: Mutex<HashSet<IpAddr>>,
    fail_rules: Mutex<Vec<FailRule>>,
    fail_write_rules: Mutex<Vec<FailRule>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted factory for tests: every command succeeds with empty output
/// unless a failure rule matches, and everything is recorded in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<ScriptedState>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` fail for this address.
    pub fn refuse_connections_to(&self, addr: IpAddr) {
        lock(&self.state.refuse).insert(addr);
    }

    /// Fails any command containing `substring`, on every host.
    pub fn fail_commands_containing(&self, substring: impl Into<String>) {
        lock(&self.state.fail_rules).push(FailRule {
            substring: substring.into(),
            host: None,
        });
    }

    /// Fails any command containing `substring` on one host.
    pub fn fail_commands_containing_on(&self, substring: impl Into<String>, host: IpAddr) {
        lock(&self.state.fail_rules).push(FailRule {
            substring: substring.into(),
            host: Some(host),
        });
    }

    /// Fails any file write whose path contains `substring`, on every host.
    pub fn fail_writes_to(&self, substring: impl Into<String>) {
        lock(&self.state.fail_write_rules).push(FailRule {
            substring: substring.into(),
            host: None,
        });
    }

    /// Fails any file write whose path contains `substring` on one host.
    pub fn fail_writes_to_on(&self, substring: impl Into<String>, host: IpAddr) {
        lock(&self.state.fail_write_rules).push(FailRule {
            substring: substring.into(),
            host: Some(host),
        });
    }

    /// Everything recorded so far, in call order across all hosts.
    pub fn calls(&self) -> Vec<ScriptedCall> {
        lock(&self.state.calls).clone()
    }

    /// Commands executed on one host, in order.
    pub fn commands_on(&self, host: IpAddr) -> Vec<String> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|call| match call {
                ScriptedCall::Exec {
                    host: h, command, ..
                } if *h == host => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many executed commands contain `needle`, across all hosts.
    pub fn command_count_containing(&self, needle: &str) -> usize {
        lock(&self.state.calls)
            .iter()
            .filter(|call| {
                matches!(call, ScriptedCall::Exec { command, .. } if command.contains(needle))
            })
            .count()
    }

    /// Files written on one host, as (path, content) in order.
    pub fn files_written_on(&self, host: IpAddr) -> Vec<(String, String)> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|call| match call {
                ScriptedCall::WriteFile {
                    host: h,
                    path,
                    content,
                } if *h == host => Some((path.clone(), content.clone())),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(
        &self,
        addr: IpAddr,
        _auth: &SshAuth,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        lock(&self.state.calls).push(ScriptedCall::Connect { host: addr });

        if lock(&self.state.refuse).contains(&addr) {
            return Err(SessionError::Connect {
                addr,
                detail: "scripted refusal".to_string(),
            });
        }

        Ok(Box::new(ScriptedSession {
            host: addr,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Session handed out by [`ScriptedFactory`].
#[derive(Debug)]
pub struct ScriptedSession {
    host: IpAddr,
    state: Arc<ScriptedState>,
}

impl ScriptedSession {
    fn run(&self, command: &str, privileged: bool) -> Result<ExecOutput, SessionError> {
        lock(&self.state.calls).push(ScriptedCall::Exec {
            host: self.host,
            command: command.to_string(),
            privileged,
        });

        let failed = lock(&self.state.fail_rules).iter().any(|rule| {
            command.contains(&rule.substring) && rule.host.map_or(true, |h| h == self.host)
        });
        if failed {
            debug!(host = %self.host, command, "[SCRIPTED] failing command");
            return Err(SessionError::CommandFailed {
                host: self.host,
                command: command.to_string(),
                exit_code: 1,
                stderr: "scripted failure".to_string(),
            });
        }

        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn execute(&self, command: &str) -> Result<ExecOutput, SessionError> {
        self.run(command, false)
    }

    async fn execute_privileged(&self, command: &str) -> Result<ExecOutput, SessionError> {
        self.run(command, true)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SessionError> {
        lock(&self.state.calls).push(ScriptedCall::WriteFile {
            host: self.host,
            path: path.to_string(),
            content: content.to_string(),
        });

        let failed = lock(&self.state.fail_write_rules).iter().any(|rule| {
            path.contains(&rule.substring) && rule.host.map_or(true, |h| h == self.host)
        });
        if failed {
            debug!(host = %self.host, path, "[SCRIPTED] failing write");
            // Failed writes surface as the receiving command failing.
            return Err(SessionError::CommandFailed {
                host: self.host,
                command: format!("cat > {path}"),
                exit_code: 1,
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn auth() -> SshAuth {
        SshAuth::password("root", "r00tme")
    }

    #[tokio::test]
    async fn test_scripted_session_records_in_order() {
        let factory = ScriptedFactory::new();
        let session = factory.connect(addr(1), &auth()).await.unwrap();

        session.execute("hostname control").await.unwrap();
        session.execute_privileged("iptables -F").await.unwrap();
        session.write_file("/etc/motd", "hello").await.unwrap();

        let calls = factory.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], ScriptedCall::Connect { host: addr(1) });
        assert_eq!(
            calls[1],
            ScriptedCall::Exec {
                host: addr(1),
                command: "hostname control".to_string(),
                privileged: false,
            }
        );
        assert_eq!(
            calls[3],
            ScriptedCall::WriteFile {
                host: addr(1),
                path: "/etc/motd".to_string(),
                content: "hello".to_string(),
            }
        );

        assert_eq!(
            factory.commands_on(addr(1)),
            ["hostname control", "iptables -F"]
        );
        assert_eq!(factory.files_written_on(addr(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure_rule_scoped_to_host() {
        let factory = ScriptedFactory::new();
        factory.fail_commands_containing_on("yum -y install", addr(3));

        let ok = factory.connect(addr(2), &auth()).await.unwrap();
        let bad = factory.connect(addr(3), &auth()).await.unwrap();

        assert!(ok.execute("yum -y install puppet").await.is_ok());
        let err = bad.execute("yum -y install puppet").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::CommandFailed { host, exit_code: 1, .. } if host == addr(3)
        ));

        // Unrelated commands on the failing host still pass.
        assert!(bad.execute("hostname agent-02").await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_write_failure_scoped_to_host() {
        let factory = ScriptedFactory::new();
        factory.fail_writes_to_on("/etc/puppet", addr(4));

        let ok = factory.connect(addr(2), &auth()).await.unwrap();
        let bad = factory.connect(addr(4), &auth()).await.unwrap();

        ok.write_file("/etc/puppet/puppet.conf", "x").await.unwrap();
        let err = bad
            .write_file("/etc/puppet/puppet.conf", "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::CommandFailed { host, exit_code: 1, .. } if host == addr(4)
        ));

        // Writes elsewhere on the failing host still pass.
        bad.write_file("/etc/motd", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_refused_connection() {
        let factory = ScriptedFactory::new();
        factory.refuse_connections_to(addr(9));

        let err = factory.connect(addr(9), &auth()).await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { addr: a, .. } if a == addr(9)));

        // The attempt itself is still recorded.
        assert_eq!(factory.calls(), [ScriptedCall::Connect { host: addr(9) }]);
    }

    #[tokio::test]
    async fn test_command_count_containing() {
        let factory = ScriptedFactory::new();
        let a = factory.connect(addr(1), &auth()).await.unwrap();
        let b = factory.connect(addr(2), &auth()).await.unwrap();

        a.execute("puppet cert sign --all").await.unwrap();
        b.execute("puppet agent --test").await.unwrap();

        assert_eq!(factory.command_count_containing("cert sign --all"), 1);
        assert_eq!(factory.command_count_containing("puppet"), 2);
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.success());

        let bad = ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(!bad.success());
    }

    #[test]
    fn test_auth_constructors() {
        let root = SshAuth::password("root", "r00tme");
        assert!(root.is_root());
        assert_eq!(root.password.as_deref(), Some("r00tme"));

        let keyed = SshAuth::identity("deploy", "/home/deploy/.ssh/id_ed25519");
        assert!(!keyed.is_root());
        assert!(keyed.identity_file.is_some());
    }
}
