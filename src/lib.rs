pub mod api;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod models;
pub mod quantity;
pub mod reaper;
pub mod sandbox;
pub mod service;
pub mod session;

pub use api::build_router;
pub use cluster::kube::KubeClient;
pub use cluster::kubeconfig::ClusterConfig;
pub use cluster::ClusterApi;
pub use config::Settings;
pub use reaper::{IdleSessionSweeper, Reaper};
pub use sandbox::SandboxManager;
pub use service::{ShellService, TerminalService};
pub use session::SessionRegistry;

pub const DEFAULT_HTTP_PORT: u16 = 8080;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_IMAGE: &str = "bitnami/kubectl:latest";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "kubectl-pod";
pub const DEFAULT_SHELL: &str = "/bin/sh";
