//! Fleet supervisor: owns every poll loop and the shutdown lifecycle.
//!
//! The source list is declarative. Callers spawn one loop per
//! [`SourceSpec`] and then hand control to [`Supervisor::run`], which waits
//! on a single cancellation token shared (as child tokens) by every loop.
//! The policy is fail-loud: a loop that returns a fatal error, panics, or
//! stops without being asked takes the whole fleet down, on the grounds
//! that a silently missing source is worse than a visible restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::StatusCache;
use crate::poll::{PollError, PollLoop, SourceSpec};
use crate::{Error, Result};

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long loops get to observe cancellation before being aborted.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// How a fleet shutdown went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Loops that were running when shutdown started.
    pub total: usize,
    /// Loops that observed cancellation and exited on their own.
    pub graceful: usize,
    /// Loops aborted at the grace deadline.
    pub forced: usize,
}

impl ShutdownReport {
    pub fn all_graceful(&self) -> bool {
        self.forced == 0
    }
}

/// Owns the poll loop tasks, their shared cancellation token, and the
/// mapping from task id back to source key for diagnostics.
pub struct Supervisor {
    cache: Arc<StatusCache>,
    config: SupervisorConfig,
    token: CancellationToken,
    tasks: JoinSet<std::result::Result<(), PollError>>,
    keys_by_task: HashMap<Id, String>,
    spawned: HashSet<String>,
}

impl Supervisor {
    pub fn new(cache: Arc<StatusCache>, config: SupervisorConfig) -> Self {
        Self {
            cache,
            config,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            keys_by_task: HashMap::new(),
            spawned: HashSet::new(),
        }
    }

    /// Token that requests fleet shutdown when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn one poll loop. Source keys must be unique across the fleet,
    /// since two loops writing one cache key would shadow each other.
    pub fn spawn(&mut self, spec: SourceSpec) -> Result<()> {
        if !self.spawned.insert(spec.key.clone()) {
            return Err(Error::validation(format!(
                "duplicate source key '{}'",
                spec.key
            )));
        }
        let key = spec.key.clone();
        let poll_loop = PollLoop::new(spec, self.cache.clone(), self.token.child_token());
        let handle = self.tasks.spawn(poll_loop.run());
        self.keys_by_task.insert(handle.id(), key.clone());
        info!("spawned poll loop for source '{key}'");
        Ok(())
    }

    fn key_for(&self, id: Id) -> String {
        self.keys_by_task
            .get(&id)
            .cloned()
            .unwrap_or_else(|| "<unknown>".to_owned())
    }

    /// Supervise until shutdown is requested (`Ok` with a report) or a loop
    /// fails fatally (`Err`, after tearing the remaining loops down).
    pub async fn run(mut self) -> Result<ShutdownReport> {
        let total = self.tasks.len();
        if total == 0 {
            info!("no sources configured; nothing to supervise");
            return Ok(ShutdownReport::default());
        }
        info!("supervising {total} poll loops");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("shutdown requested; draining poll loops");
                    return Ok(self.drain(total, 0).await);
                }
                joined = self.tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        return Err(Error::other("all poll loops exited unexpectedly"));
                    };
                    match joined {
                        Ok((id, Ok(()))) => {
                            // A loop only returns Ok once its token is
                            // cancelled, so a clean exit here means the
                            // shutdown raced our own select arm.
                            if self.token.is_cancelled() {
                                return Ok(self.drain(total, 1).await);
                            }
                            let key = self.key_for(id);
                            return self
                                .tear_down(key, "stopped without a shutdown request".to_owned(), total)
                                .await;
                        }
                        Ok((id, Err(poll_err))) => {
                            let key = self.key_for(id);
                            return self.tear_down(key, poll_err.to_string(), total).await;
                        }
                        Err(join_err) => {
                            let key = self.key_for(join_err.id());
                            return self
                                .tear_down(key, format!("poll loop panicked: {join_err}"), total)
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Fail-loud path: cancel the fleet, drain it, and surface the failure.
    async fn tear_down(&mut self, key: String, reason: String, total: usize) -> Result<ShutdownReport> {
        error!("source '{key}' failed fatally ({reason}); tearing down the fleet");
        self.token.cancel();
        let report = self.drain(total, 0).await;
        warn!(
            "fleet torn down: {} graceful, {} forced",
            report.graceful, report.forced
        );
        Err(Error::SourceFailure { key, reason })
    }

    /// Wait for the remaining loops to observe cancellation; abort whatever
    /// is still running when the grace deadline passes.
    async fn drain(&mut self, total: usize, mut graceful: usize) -> ShutdownReport {
        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(Ok(()))) => graceful += 1,
                        Some(Ok(Err(err))) => {
                            warn!("poll loop exited with an error during shutdown: {err}");
                            graceful += 1;
                        }
                        Some(Err(join_err)) => {
                            warn!("poll loop join error during shutdown: {join_err}");
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let stragglers = self.tasks.len();
                    warn!("{stragglers} poll loops missed the shutdown deadline; aborting them");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    return ShutdownReport { total, graceful, forced: stragglers };
                }
            }
        }
        ShutdownReport {
            total,
            graceful,
            forced: 0,
        }
    }
}
