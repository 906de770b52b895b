//! Bounded readiness polling.
//!
//! Provisioned nodes come up asynchronously and the only readiness signal
//! is "the service answers". This crate provides the one retry primitive
//! the rest of corral uses: poll a predicate at a fixed interval until it
//! holds or a deadline passes.
//!
//! # Invariants
//!
//! - Every wait is bounded; there is no unbounded retry
//! - The predicate is checked once immediately, then once per interval
//! - Between polls the task sleeps; there is no busy loop

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Port a node is considered reachable on.
pub const SSH_PORT: u16 = 22;

/// Readiness wait errors.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Deadline passed before the condition held.
    #[error("timeout after {elapsed:?} waiting for {target}")]
    Timeout { target: String, elapsed: Duration },
}

/// How long to wait overall and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

impl Default for WaitPolicy {
    /// Bring-up default: thirty minutes, polling every five seconds.
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Polls `probe` until it returns true or the policy's deadline passes.
///
/// `target` labels the timeout error and log lines; it does not affect
/// behavior.
pub async fn wait_until<F, Fut>(
    target: &str,
    policy: WaitPolicy,
    mut probe: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if probe().await {
            debug!(target, elapsed = ?started.elapsed(), "condition holds");
            return Ok(());
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(WaitError::Timeout {
                target: target.to_string(),
                elapsed,
            });
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}

/// Attempts a TCP connection, true if it completes within `connect_timeout`.
pub async fn tcp_ping(addr: SocketAddr, connect_timeout: Duration) -> bool {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "tcp probe failed");
            false
        }
        Err(_) => {
            debug!(addr = %addr, "tcp probe timed out");
            false
        }
    }
}

/// Waits until `addr` accepts TCP connections.
///
/// Each connect attempt gets the polling gap as its budget, so a hanging
/// connect never starves the next poll for long.
pub async fn wait_tcp(target: &str, addr: SocketAddr, policy: WaitPolicy) -> Result<(), WaitError> {
    wait_until(target, policy, || tcp_ping(addr, policy.poll_interval)).await
}
