//! Seam to the cluster control API: sandbox pods, home volumes, and
//! interactive exec channels.
//!
//! The lifecycle manager and the bridge only talk to [`ClusterApi`]; the
//! cluster itself is the source of truth, so nothing here caches state.

pub mod kube;
pub mod kubeconfig;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use crate::models::{Sandbox, SandboxSpec, TerminalSize, VolumeSpec};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Exit status Kubernetes reports for a SIGKILLed process.
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} already exists")]
    Conflict { kind: &'static str, name: String },
    #[error("cluster API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("cluster request timed out after {0:?}")]
    Timeout(Duration),
    #[error("cluster transport error: {0}")]
    Transport(String),
    #[error("cluster protocol error: {0}")]
    Protocol(String),
    #[error("cluster configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            // reqwest does not expose the configured value here
            ClusterError::Timeout(Duration::from_secs(30))
        } else {
            ClusterError::Transport(error.to_string())
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Clone, Debug)]
pub struct ExecRequest {
    pub sandbox: String,
    pub container: String,
    pub command: Vec<String>,
    /// Geometry applied once when the process starts.
    pub initial_size: Option<TerminalSize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    ExitCode(i32),
    Failure(String),
}

#[derive(Debug)]
pub enum ExecEvent {
    /// Merged stdout/stderr bytes.
    Output(Vec<u8>),
    Exit(ExecStatus),
}

/// Client side of an interactive process. Dropping `stdin` closes the
/// process input and tears the channel down.
pub struct ExecChannel {
    pub stdin: mpsc::Sender<Vec<u8>>,
    pub resize: mpsc::Sender<TerminalSize>,
    pub events: mpsc::Receiver<ExecEvent>,
}

#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn get_sandbox(&self, name: &str) -> ClusterResult<Option<Sandbox>>;
    async fn create_sandbox(&self, spec: &SandboxSpec) -> ClusterResult<Sandbox>;
    /// Fails with [`ClusterError::NotFound`] when the sandbox is already gone.
    async fn delete_sandbox(&self, name: &str) -> ClusterResult<()>;
    async fn list_sandboxes(&self, selector: &BTreeMap<String, String>)
        -> ClusterResult<Vec<Sandbox>>;
    async fn patch_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> ClusterResult<()>;
    async fn volume_exists(&self, name: &str) -> ClusterResult<bool>;
    async fn create_volume(&self, spec: &VolumeSpec) -> ClusterResult<()>;
    async fn exec(&self, request: ExecRequest) -> ClusterResult<ExecChannel>;
}

/// Renders a selector map as `k1=v1,k2=v2`.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
