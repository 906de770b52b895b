//! OpenSSH-backed sessions.
//!
//! Each command runs as one `ssh` invocation, so no connection state is
//! held between commands. Password authentication goes through `sshpass`;
//! both binaries must be on PATH on the machine running corral.

use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::session::{ExecOutput, RemoteSession, SessionError, SessionFactory, SshAuth};

/// Per-attempt connect timeout handed to ssh, in seconds.
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Opens [`OpensshSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensshFactory;

impl OpensshFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for OpensshFactory {
    async fn connect(
        &self,
        addr: IpAddr,
        auth: &SshAuth,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        let session = OpensshSession {
            addr,
            auth: auth.clone(),
        };
        session.probe().await?;
        Ok(Box::new(session))
    }
}

/// A session that shells out to `ssh` per command.
#[derive(Debug)]
pub struct OpensshSession {
    addr: IpAddr,
    auth: SshAuth,
}

impl OpensshSession {
    /// Runs a no-op remote command to prove the node accepts sessions.
    async fn probe(&self) -> Result<(), SessionError> {
        match self.run("true", None).await {
            Ok(_) => Ok(()),
            Err(SessionError::CommandFailed { stderr, .. }) => Err(SessionError::Connect {
                addr: self.addr,
                detail: stderr,
            }),
            Err(SessionError::Transport { detail, .. }) => Err(SessionError::Connect {
                addr: self.addr,
                detail,
            }),
            Err(other) => Err(other),
        }
    }

    async fn run(&self, command: &str, stdin: Option<&str>) -> Result<ExecOutput, SessionError> {
        let argv = ssh_argv(self.addr, &self.auth, command);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| SessionError::Transport {
            host: self.addr,
            detail: e.to_string(),
        })?;

        if let Some(content) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(content.as_bytes())
                    .await
                    .map_err(|e| SessionError::Transport {
                        host: self.addr,
                        detail: e.to_string(),
                    })?;
                // Dropping the handle closes the remote stdin.
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SessionError::Transport {
                host: self.addr,
                detail: e.to_string(),
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let result = ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            return Err(SessionError::CommandFailed {
                host: self.addr,
                command: command.to_string(),
                exit_code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteSession for OpensshSession {
    async fn execute(&self, command: &str) -> Result<ExecOutput, SessionError> {
        debug!(host = %self.addr, command, "executing");
        self.run(command, None).await
    }

    async fn execute_privileged(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let wrapped = privileged_command(&self.auth, command);
        debug!(host = %self.addr, command = %wrapped, "executing privileged");
        self.run(&wrapped, None).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SessionError> {
        let receive = privileged_command(&self.auth, &format!("cat > {}", quoted(path)));
        debug!(host = %self.addr, path, bytes = content.len(), "writing file");
        self.run(&receive, Some(content)).await.map(|_| ())
    }
}

/// Full argv for one remote command, program name first.
fn ssh_argv(addr: IpAddr, auth: &SshAuth, command: &str) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();

    if let Some(password) = &auth.password {
        argv.extend([
            "sshpass".to_string(),
            "-p".to_string(),
            password.clone(),
            "ssh".to_string(),
        ]);
    } else {
        argv.push("ssh".to_string());
        // Key auth must never stop at a password prompt.
        argv.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
    }

    argv.extend([
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
    ]);

    if let Some(identity) = &auth.identity_file {
        argv.extend(["-i".to_string(), identity.display().to_string()]);
    }

    argv.push(format!("{}@{}", auth.username, addr));
    argv.push(command.to_string());
    argv
}

/// Wraps a command for elevated execution. Root sessions run it as-is.
fn privileged_command(auth: &SshAuth, command: &str) -> String {
    if auth.is_root() {
        command.to_string()
    } else {
        format!("sudo -n sh -c {}", quoted(command))
    }
}

/// Single-quotes `s` for the remote shell, escaping embedded quotes.
fn quoted(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        IpAddr::from([192, 168, 1, 10])
    }

    #[test]
    fn test_argv_password_auth() {
        let auth = SshAuth::password("root", "r00tme");
        let argv = ssh_argv(addr(), &auth, "hostname control");

        assert_eq!(argv[0], "sshpass");
        assert_eq!(&argv[1..4], ["-p", "r00tme", "ssh"]);
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
        assert_eq!(argv[argv.len() - 2], "root@192.168.1.10");
        assert_eq!(argv[argv.len() - 1], "hostname control");
    }

    #[test]
    fn test_argv_key_auth() {
        let auth = SshAuth::identity("deploy", "/tmp/id_ed25519");
        let argv = ssh_argv(addr(), &auth, "true");

        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(!argv.contains(&"sshpass".to_string()));

        let i = argv.iter().position(|a| a == "-i").unwrap();
        assert_eq!(argv[i + 1], "/tmp/id_ed25519");
    }

    #[test]
    fn test_argv_common_options() {
        let auth = SshAuth::password("root", "r00tme");
        let argv = ssh_argv(addr(), &auth, "true");

        assert!(argv.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(argv.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(argv.contains(&format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}")));
    }

    #[test]
    fn test_privileged_command_root_passthrough() {
        let root = SshAuth::password("root", "r00tme");
        assert_eq!(privileged_command(&root, "iptables -F"), "iptables -F");
    }

    #[test]
    fn test_privileged_command_sudo_wrap() {
        let user = SshAuth::identity("deploy", "/tmp/key");
        assert_eq!(
            privileged_command(&user, "iptables -F"),
            "sudo -n sh -c 'iptables -F'"
        );
    }

    #[test]
    fn test_quoting_embedded_single_quote() {
        assert_eq!(quoted("it's"), r"'it'\''s'");
        assert_eq!(quoted("/etc/puppet/puppet.conf"), "'/etc/puppet/puppet.conf'");
    }
}
