//! Background cleanup: stale sandboxes by heartbeat, idle sessions by use.

use crate::sandbox::SandboxManager;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on deleting one idle session's sandbox.
const SWEEP_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodically deletes sandboxes whose heartbeat has gone stale.
pub struct Reaper {
    sandboxes: Arc<SandboxManager>,
    interval: Duration,
    timeout: Duration,
}

impl Reaper {
    pub fn new(sandboxes: Arc<SandboxManager>, interval: Duration, timeout: Duration) -> Self {
        Self {
            sandboxes,
            interval,
            timeout,
        }
    }

    /// One pass. Listing failures are logged and the pass is skipped.
    pub async fn run_once(&self) -> usize {
        match self.sandboxes.reap(self.timeout).await {
            Ok(0) => {
                debug!("no stale sandboxes");
                0
            }
            Ok(reaped) => {
                info!(reaped, "reaped stale sandboxes");
                reaped
            }
            Err(err) => {
                warn!(error = %err, "failed to list sandboxes for reaping");
                0
            }
        }
    }

    /// Runs a pass immediately, then every `interval`, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "sandbox reaper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
        info!("sandbox reaper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

/// Forgets sessions nobody has used for a while, deleting their sandbox
/// first unless another attached session still needs it.
pub struct IdleSessionSweeper {
    registry: Arc<SessionRegistry>,
    sandboxes: Arc<SandboxManager>,
    idle_timeout: Duration,
    interval: Duration,
}

impl IdleSessionSweeper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sandboxes: Arc<SandboxManager>,
        idle_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            sandboxes,
            idle_timeout,
            interval,
        }
    }

    /// Returns the ids removed in this pass.
    pub async fn sweep_once(&self) -> Vec<String> {
        let registry = &self.registry;
        let sandboxes = &self.sandboxes;

        let removed = self
            .registry
            .sweep_idle(self.idle_timeout, |session| async move {
                if registry.sandbox_in_use(&session.sandbox_ref, &session.id) {
                    debug!(session_id = %session.id, "sandbox shared with an attached session");
                    return true;
                }
                match tokio::time::timeout(
                    SWEEP_DELETE_TIMEOUT,
                    sandboxes.delete(&session.sandbox_ref),
                )
                .await
                {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        warn!(
                            session_id = %session.id,
                            sandbox = %session.sandbox_ref,
                            error = %err,
                            "failed to delete idle session sandbox, will retry"
                        );
                        false
                    }
                    Err(_) => {
                        warn!(
                            session_id = %session.id,
                            sandbox = %session.sandbox_ref,
                            "timed out deleting idle session sandbox, will retry"
                        );
                        false
                    }
                }
            })
            .await;

        if !removed.is_empty() {
            info!(count = removed.len(), "swept idle sessions");
        }
        removed
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; nothing can be idle yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        debug!("idle session sweeper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
