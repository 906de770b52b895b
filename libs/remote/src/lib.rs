//! # corral-remote
//!
//! Authenticated remote shell sessions for cluster nodes.
//!
//! ## Design Principles
//!
//! - Connecting is explicit: a factory probes the node before handing out
//!   a session, so a dead node fails at connect time, not mid-step
//! - Commands are fire-and-check: non-zero exit is an error and stdout is
//!   never parsed for meaning
//! - Sessions keep no shell state between commands
//! - A scripted implementation ships next to the trait for tests

mod openssh;
mod session;

pub use openssh::{OpensshFactory, OpensshSession};
pub use session::{
    ExecOutput, RemoteSession, ScriptedCall, ScriptedFactory, ScriptedSession, SessionError,
    SessionFactory, SshAuth,
};
