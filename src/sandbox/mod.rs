//! Per-owner sandbox pods: naming, provisioning progress, and the lifecycle
//! manager that creates, reuses, heartbeats and reaps them.

pub mod manager;
pub mod naming;
pub mod progress;

pub use manager::{LifecycleTimings, SandboxConfig, SandboxManager};
pub use naming::{sandbox_name, sanitize_owner, volume_name, DEFAULT_OWNER};
pub use progress::{no_status, StatusSink};
