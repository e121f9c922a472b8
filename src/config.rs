//! Command-line and environment configuration for the server.

use crate::cluster::kubeconfig::ClusterConfig;
use crate::sandbox::{LifecycleTimings, SandboxConfig};
use crate::service::ServiceOptions;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "kubeshell-server", author, version)]
pub struct Settings {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "KUBESHELL_BIND")]
    pub bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = crate::DEFAULT_HTTP_PORT, env = "PORT")]
    pub port: u16,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/kubeshell", env = "KUBESHELL_LOG_DIR")]
    pub log_dir: PathBuf,
    /// Kubeconfig file; falls back to in-cluster credentials, then ~/.kube/config
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
    /// Namespace sandboxes are created in; defaults to the cluster
    /// connection's namespace, then "default"
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,
    /// Container image for sandboxes
    #[arg(long, default_value = crate::DEFAULT_IMAGE, env = "POD_IMAGE")]
    pub image: String,
    #[arg(long, default_value = crate::DEFAULT_SERVICE_ACCOUNT, env = "POD_SERVICE_ACCOUNT")]
    pub service_account: String,
    #[arg(long, default_value = "500m", env = "POD_CPU_LIMIT")]
    pub cpu_limit: String,
    #[arg(long, default_value = "512Mi", env = "POD_MEMORY_LIMIT")]
    pub memory_limit: String,
    /// Size of each owner's persistent home volume
    #[arg(long, default_value = "1Gi", env = "HOME_VOLUME_SIZE")]
    pub home_volume_size: String,
    /// Program started for every terminal
    #[arg(long, default_value = crate::DEFAULT_SHELL, env = "SANDBOX_SHELL")]
    pub shell: String,
    /// Idle time after which a detached session is forgotten
    #[arg(long, default_value_t = 3600, env = "SESSION_TIMEOUT_SECS")]
    pub session_idle_timeout_secs: u64,
    #[arg(long, default_value_t = 60, env = "REAP_INTERVAL_SECS")]
    pub reap_interval_secs: u64,
    /// Heartbeat age after which a sandbox is deleted
    #[arg(long, default_value_t = 300, env = "REAP_TIMEOUT_SECS")]
    pub reap_timeout_secs: u64,
}

impl Settings {
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            image: self.image.clone(),
            service_account: self.service_account.clone(),
            cpu_limit: self.cpu_limit.clone(),
            memory_limit: self.memory_limit.clone(),
            home_volume_size: self.home_volume_size.clone(),
        }
    }

    pub fn lifecycle_timings(&self) -> LifecycleTimings {
        LifecycleTimings::default()
    }

    /// Explicit setting first, then whatever the cluster connection names.
    pub fn namespace(&self, cluster: &ClusterConfig) -> String {
        self.namespace
            .clone()
            .or_else(|| cluster.namespace.clone())
            .unwrap_or_else(|| crate::DEFAULT_NAMESPACE.to_string())
    }

    pub fn service_options(&self, namespace: &str) -> ServiceOptions {
        ServiceOptions {
            shell: self.shell.clone(),
            namespace: namespace.to_string(),
            ..ServiceOptions::default()
        }
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(namespace: Option<&str>) -> ClusterConfig {
        ClusterConfig {
            server: "https://10.0.0.1:6443".parse().unwrap(),
            namespace: namespace.map(str::to_string),
            token: None,
            ca_pem: None,
            identity: None,
            insecure: false,
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::try_parse_from(["kubeshell-server"]).unwrap();

        assert_eq!(settings.port, 8080);
        assert_eq!(settings.image, "bitnami/kubectl:latest");
        assert_eq!(settings.service_account, "kubectl-pod");
        assert_eq!(settings.shell, "/bin/sh");
        assert_eq!(settings.session_idle_timeout(), Duration::from_secs(3600));
        assert_eq!(settings.reap_timeout(), Duration::from_secs(300));

        let sandbox = settings.sandbox_config();
        assert_eq!(sandbox.cpu_limit, "500m");
        assert_eq!(sandbox.memory_limit, "512Mi");
        assert_eq!(sandbox.home_volume_size, "1Gi");
    }

    #[test]
    fn namespace_falls_back_to_cluster_then_default() {
        let settings = Settings::try_parse_from(["kubeshell-server"]).unwrap();
        if settings.namespace.is_some() {
            // POD_NAMESPACE is set in this environment
            return;
        }

        assert_eq!(settings.namespace(&cluster(Some("shells"))), "shells");
        assert_eq!(settings.namespace(&cluster(None)), "default");
    }

    #[test]
    fn flags_override_defaults() {
        let settings = Settings::try_parse_from([
            "kubeshell-server",
            "--namespace",
            "terminals",
            "--memory-limit",
            "1Gi",
            "--reap-interval-secs",
            "0",
        ])
        .unwrap();

        assert_eq!(settings.namespace(&cluster(Some("shells"))), "terminals");
        assert_eq!(settings.service_options("terminals").namespace, "terminals");
        assert_eq!(settings.sandbox_config().memory_limit, "1Gi");
        assert_eq!(settings.reap_interval(), Duration::from_secs(1));
    }
}
