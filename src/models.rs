use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

/// Annotation holding the RFC 3339 timestamp of the last confirmed liveness.
pub const HEARTBEAT_ANNOTATION: &str = "kubeshell.io/last-heartbeat";

pub const LABEL_APP: &str = "app";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_OWNER: &str = "owner";
pub const LABEL_SESSION: &str = "session-id";
pub const APP_NAME: &str = "kubeshell";
pub const MANAGER_NAME: &str = "kubeshell-server";

/// The single container in every sandbox pod; exec targets it.
pub const CONTAINER_NAME: &str = "terminal";

/// Labels carried by every object this server creates; also the reaper's selector.
pub fn ownership_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), APP_NAME.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
    ])
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub enum SandboxPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl SandboxPhase {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => SandboxPhase::Pending,
            "Running" => SandboxPhase::Running,
            "Succeeded" => SandboxPhase::Succeeded,
            "Failed" => SandboxPhase::Failed,
            _ => SandboxPhase::Unknown,
        }
    }

    /// Phases from which a pod can no longer become ready.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxPhase::Succeeded | SandboxPhase::Failed)
    }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Running => "Running",
            SandboxPhase::Succeeded => "Succeeded",
            SandboxPhase::Failed => "Failed",
            SandboxPhase::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Observed state of a sandbox pod, as last read from the cluster.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct Sandbox {
    pub name: String,
    pub owner: String,
    pub phase: SandboxPhase,
    pub ready: bool,
    /// A deletion has been requested and the pod is shutting down.
    pub terminating: bool,
    pub created_at: DateTime<Utc>,
    pub home_volume: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Sandbox {
    pub fn is_reusable(&self) -> bool {
        self.phase == SandboxPhase::Running && self.ready && !self.terminating
    }

    /// Parsed heartbeat annotation; `None` when missing or malformed.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.annotations
            .get(HEARTBEAT_ANNOTATION)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Reference point for staleness: the heartbeat, else the creation time.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat().unwrap_or(self.created_at)
    }
}

/// Everything needed to create a sandbox pod.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub name: String,
    pub owner: String,
    pub session_id: String,
    pub image: String,
    pub service_account: String,
    pub cpu: String,
    pub memory: String,
    pub home_volume: String,
    pub heartbeat: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct VolumeSpec {
    pub name: String,
    pub owner: String,
    pub size: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Structured text frames exchanged with the terminal client.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Session {
        session_id: String,
        sandbox: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub sandbox: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct TeardownResponse {
    pub status: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
