//! Remote execution over ssh.
//!
//! [`Transport`] abstracts session establishment so the loop can be driven
//! by scripted sessions in tests. [`SshTransport`] is the production
//! implementation: every `connect` starts a multiplexed ssh master
//! connection, and each cycle runs the composed bundle through the remote
//! login shell.

use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder};
use tracing::debug;

use super::{PollError, stderr_excerpt};

/// Establishes sessions for a transport-backed poll loop.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, PollError>;
}

/// One established remote session.
///
/// Any `run` error means the session is no longer trusted; the loop closes
/// it and reconnects after the degraded delay.
#[async_trait]
pub trait TransportSession: Send {
    async fn run(&mut self, command: &str) -> Result<String, PollError>;

    /// Tear the session down. Close failures are logged, never surfaced.
    async fn close(&mut self);
}

/// Address of one ssh endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    /// Login user; `None` defers to ssh configuration.
    pub user: Option<String>,
}

/// Transport over openssh master connections.
///
/// Authentication is whatever the ambient ssh configuration provides
/// (agent, keys, config file); host keys are accepted on first use.
pub struct SshTransport {
    endpoint: RemoteEndpoint,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(endpoint: RemoteEndpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, PollError> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Accept)
            .port(self.endpoint.port)
            .connect_timeout(self.connect_timeout);
        if let Some(user) = &self.endpoint.user {
            builder.user(user.clone());
        }

        let session = builder.connect(&self.endpoint.host).await.map_err(|err| {
            PollError::transient(format!("ssh connect to {} failed: {err}", self.endpoint.host))
        })?;
        debug!("ssh master connection to {} established", self.endpoint.host);

        Ok(Box::new(SshSession {
            session: Some(session),
        }))
    }
}

struct SshSession {
    session: Option<Session>,
}

#[async_trait]
impl TransportSession for SshSession {
    async fn run(&mut self, command: &str) -> Result<String, PollError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| PollError::transient("ssh session already closed"))?;

        let output = session
            .shell(command)
            .output()
            .await
            .map_err(|err| PollError::transient(format!("ssh session error: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PollError::transient(format!(
                "remote command exited with {}: {}",
                output.status,
                stderr_excerpt(&stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                debug!("ssh session close: {err}");
            }
        }
    }
}
