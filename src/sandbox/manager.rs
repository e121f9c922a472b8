use super::naming::{sandbox_name, sanitize_owner, volume_name};
use super::progress::{Progress, StatusSink};
use crate::cluster::{ClusterApi, ClusterError, ClusterResult};
use crate::errors::{ShellError, ShellResult};
use crate::models::{ownership_labels, Sandbox, SandboxSpec, VolumeSpec, HEARTBEAT_ANNOTATION};
use crate::quantity::Quantity;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What every sandbox pod is built from.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub image: String,
    pub service_account: String,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub home_volume_size: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: crate::DEFAULT_IMAGE.to_string(),
            service_account: crate::DEFAULT_SERVICE_ACCOUNT.to_string(),
            cpu_limit: "500m".to_string(),
            memory_limit: "512Mi".to_string(),
            home_volume_size: "1Gi".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LifecycleTimings {
    pub readiness_poll: Duration,
    pub readiness_timeout: Duration,
    pub termination_poll: Duration,
    pub termination_timeout: Duration,
    /// Upper bound for any single cluster call.
    pub call_timeout: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            readiness_poll: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(5 * 60),
            termination_poll: Duration::from_secs(1),
            termination_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SandboxManager {
    api: Arc<dyn ClusterApi>,
    config: SandboxConfig,
    cpu: Quantity,
    memory: Quantity,
    volume_size: Quantity,
    timings: LifecycleTimings,
    owner_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn parse_quantity(field: &'static str, value: &str) -> ShellResult<Quantity> {
    value.parse().map_err(|reason| ShellError::InvalidQuantity {
        field,
        value: value.to_string(),
        reason,
    })
}

impl SandboxManager {
    /// Fails with [`ShellError::InvalidQuantity`] when a resource limit is malformed.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        config: SandboxConfig,
        timings: LifecycleTimings,
    ) -> ShellResult<Self> {
        let cpu = parse_quantity("cpu", &config.cpu_limit)?;
        let memory = parse_quantity("memory", &config.memory_limit)?;
        let volume_size = parse_quantity("home volume size", &config.home_volume_size)?;

        Ok(Self {
            api,
            config,
            cpu,
            memory,
            volume_size,
            timings,
            owner_locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    async fn call<T>(&self, request: impl Future<Output = ClusterResult<T>>) -> ClusterResult<T> {
        let limit = self.timings.call_timeout;
        tokio::time::timeout(limit, request)
            .await
            .map_err(|_| ClusterError::Timeout(limit))?
    }

    fn owner_lock(&self, owner: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.owner_locks.lock();
        // drop entries nobody is waiting on
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(owner.to_string()).or_default().clone()
    }

    /// Returns a Running+Ready sandbox for `owner`, reusing a healthy one or
    /// creating it. Calls for the same owner are serialized.
    pub async fn ensure_sandbox(
        &self,
        owner: &str,
        session_id: &str,
        status: &StatusSink<'_>,
    ) -> ShellResult<Sandbox> {
        let owner = sanitize_owner(owner);
        let name = sandbox_name(&owner);
        let progress = Progress::new(status, Instant::now());

        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;

        self.ensure_volume(&owner, &progress).await?;

        let current = match self.find_existing(&owner).await {
            Ok(found) => found,
            Err(err) => {
                // a failed lookup must not be mistaken for a missing sandbox
                debug!(sandbox = %name, error = %err, "existing sandbox lookup failed, retrying once");
                self.call(self.api.get_sandbox(&name)).await?
            }
        };

        if let Some(existing) = current.filter(Sandbox::is_reusable) {
            progress.done(&format!("Found existing session for {owner}"));
            self.heartbeat(&existing.name).await;
            info!(sandbox = %existing.name, owner = %owner, "reusing sandbox");
            return Ok(existing);
        }

        if let Some(stale) = self.call(self.api.get_sandbox(&name)).await? {
            if stale.is_reusable() {
                progress.done(&format!("Found existing session for {owner}"));
                self.heartbeat(&stale.name).await;
                return Ok(stale);
            }
            progress.pending(&format!("Cleaning up existing sandbox for {owner}..."));
            if !stale.terminating {
                if let Err(err) = self.delete(&name).await {
                    progress.warn(&format!("Failed to delete existing sandbox: {err}"));
                }
            }
            self.wait_for_absence(&name, &progress).await?;
            progress.done("Previous session cleaned up");
        }

        let spec = SandboxSpec {
            name: name.clone(),
            owner: owner.clone(),
            session_id: session_id.to_string(),
            image: self.config.image.clone(),
            service_account: self.config.service_account.clone(),
            cpu: self.cpu.to_string(),
            memory: self.memory.to_string(),
            home_volume: volume_name(&owner),
            heartbeat: Utc::now(),
        };

        progress.pending("Creating sandbox...");
        if let Err(err) = self.call(self.api.create_sandbox(&spec)).await {
            progress.failed("Failed to create sandbox");
            return Err(err.into());
        }
        progress.done(&format!("Sandbox created ({})", progress.elapsed_label()));
        info!(sandbox = %name, owner = %owner, session_id, "sandbox created");

        progress.pending("Waiting for sandbox to be ready...");
        match self.wait_until_ready(&name, &progress).await {
            Ok(sandbox) => {
                progress.done(&format!("Sandbox is ready ({})", progress.elapsed_label()));
                progress.pending("Starting terminal session...");
                Ok(sandbox)
            }
            Err(err) => {
                progress.failed("Sandbox failed to become ready");
                warn!(sandbox = %name, error = %err, "sandbox never became ready, removing it");
                if let Err(cleanup) = self.delete(&name).await {
                    warn!(sandbox = %name, error = %cleanup, "failed to remove half-created sandbox");
                }
                Err(err)
            }
        }
    }

    async fn ensure_volume(&self, owner: &str, progress: &Progress<'_>) -> ShellResult<()> {
        let volume = volume_name(owner);
        let provisioned = async {
            if self.call(self.api.volume_exists(&volume)).await? {
                progress.done(&format!("Home storage ready for {owner}"));
                return Ok(());
            }

            progress.pending(&format!("Creating home storage for {owner}..."));
            let spec = VolumeSpec {
                name: volume.clone(),
                owner: owner.to_string(),
                size: self.volume_size.to_string(),
            };
            match self.call(self.api.create_volume(&spec)).await {
                // lost a race with another replica; the claim exists either way
                Ok(()) | Err(ClusterError::Conflict { .. }) => {}
                Err(err) => return Err(err),
            }
            progress.done(&format!("Home storage created for {owner}"));
            Ok::<(), ClusterError>(())
        };

        provisioned.await.map_err(|source| {
            progress.failed(&format!("Failed to create home storage: {source}"));
            ShellError::VolumeProvisioning { volume, source }
        })
    }

    async fn wait_until_ready(&self, name: &str, progress: &Progress<'_>) -> ShellResult<Sandbox> {
        let deadline = Instant::now() + self.timings.readiness_timeout;
        loop {
            match self.call(self.api.get_sandbox(name)).await {
                Ok(Some(sandbox)) => {
                    if sandbox.phase.is_terminal() {
                        progress.failed(&format!(
                            "Sandbox phase: {} ({})",
                            sandbox.phase,
                            progress.elapsed_label()
                        ));
                        return Err(ShellError::SandboxFailed {
                            name: name.to_string(),
                            phase: sandbox.phase.to_string(),
                        });
                    }
                    if sandbox.is_reusable() {
                        return Ok(sandbox);
                    }
                    progress.pending(&format!(
                        "Waiting for sandbox to be ready... ({}, {})",
                        sandbox.phase,
                        progress.elapsed_label()
                    ));
                }
                Ok(None) => return Err(ShellError::SandboxNotFound(name.to_string())),
                Err(err) => debug!(sandbox = %name, error = %err, "readiness poll failed, retrying"),
            }

            if Instant::now() >= deadline {
                return Err(ShellError::ReadinessTimeout {
                    name: name.to_string(),
                    waited: self.timings.readiness_timeout,
                });
            }
            tokio::time::sleep(self.timings.readiness_poll).await;
        }
    }

    async fn wait_for_absence(&self, name: &str, progress: &Progress<'_>) -> ShellResult<()> {
        let started = Instant::now();
        let deadline = started + self.timings.termination_timeout;
        loop {
            match self.call(self.api.get_sandbox(name)).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => progress.pending(&format!(
                    "Waiting for previous session to terminate... ({})",
                    super::progress::format_elapsed(started.elapsed())
                )),
                Err(err) => debug!(sandbox = %name, error = %err, "termination poll failed, retrying"),
            }

            if Instant::now() >= deadline {
                progress.failed("Timeout waiting for old sandbox to terminate");
                return Err(ShellError::TerminationTimeout {
                    name: name.to_string(),
                    waited: self.timings.termination_timeout,
                });
            }
            tokio::time::sleep(self.timings.termination_poll).await;
        }
    }

    /// Running+Ready, non-terminating sandbox for `owner`, if there is one.
    pub async fn find_existing(&self, owner: &str) -> ShellResult<Option<Sandbox>> {
        let name = sandbox_name(&sanitize_owner(owner));
        let sandbox = self.call(self.api.get_sandbox(&name)).await?;
        Ok(sandbox.filter(Sandbox::is_reusable))
    }

    pub async fn get(&self, name: &str) -> ShellResult<Sandbox> {
        self.call(self.api.get_sandbox(name))
            .await?
            .ok_or_else(|| ShellError::SandboxNotFound(name.to_string()))
    }

    /// Succeeds when the sandbox is already gone.
    pub async fn delete(&self, name: &str) -> ShellResult<()> {
        match self.call(self.api.delete_sandbox(name)).await {
            Ok(()) => {
                info!(sandbox = %name, "sandbox deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(sandbox = %name, "sandbox already absent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Best effort: a sandbox vanishing under the update is expected.
    pub async fn heartbeat(&self, name: &str) {
        let annotations =
            BTreeMap::from([(HEARTBEAT_ANNOTATION.to_string(), Utc::now().to_rfc3339())]);
        match self.call(self.api.patch_annotations(name, &annotations)).await {
            Ok(()) => debug!(sandbox = %name, "heartbeat refreshed"),
            Err(err) if err.is_not_found() => debug!(sandbox = %name, "heartbeat skipped, sandbox gone"),
            Err(err) => warn!(sandbox = %name, error = %err, "failed to refresh heartbeat"),
        }
    }

    /// Deletes every owned, non-terminating sandbox whose heartbeat (or
    /// creation time, without one) is older than `timeout`. Returns how many
    /// were deleted.
    pub async fn reap(&self, timeout: Duration) -> ShellResult<usize> {
        let sandboxes = self
            .call(self.api.list_sandboxes(&ownership_labels()))
            .await?;
        let now = Utc::now();
        let mut reaped = 0;

        for sandbox in sandboxes.iter().filter(|s| !s.terminating) {
            let idle = (now - sandbox.last_seen()).to_std().unwrap_or(Duration::ZERO);
            if idle <= timeout {
                continue;
            }

            info!(
                sandbox = %sandbox.name,
                idle_secs = idle.as_secs(),
                "reaping stale sandbox"
            );
            match self.delete(&sandbox.name).await {
                Ok(()) => reaped += 1,
                Err(err) => warn!(sandbox = %sandbox.name, error = %err, "failed to reap sandbox"),
            }
        }

        Ok(reaped)
    }
}
