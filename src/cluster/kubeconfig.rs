//! Discovery of the cluster endpoint and credentials.
//!
//! Resolution order: an explicit kubeconfig path, then the in-cluster
//! service account, then `$HOME/.kube/config`.

use super::{ClusterError, ClusterResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Client certificate and key, both PEM encoded.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Clone)]
pub struct ClusterConfig {
    pub server: Url,
    /// Namespace named by the kubeconfig context or the service account.
    pub namespace: Option<String>,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub identity: Option<ClientIdentity>,
    pub insecure: bool,
}

impl ClusterConfig {
    pub fn infer(kubeconfig: Option<&Path>) -> ClusterResult<Self> {
        if let Some(path) = kubeconfig {
            return Self::from_kubeconfig(path);
        }

        if let Some(config) = Self::in_cluster()? {
            return Ok(config);
        }

        let home = env::var_os("HOME").ok_or_else(|| {
            ClusterError::Config(
                "no kubeconfig given, not running in a cluster, and HOME is unset".to_string(),
            )
        })?;
        Self::from_kubeconfig(&PathBuf::from(home).join(".kube").join("config"))
    }

    /// Service-account credentials mounted into every pod. `None` when the
    /// process is not running inside a cluster.
    pub fn in_cluster() -> ClusterResult<Option<Self>> {
        let (Ok(host), Ok(port)) = (
            env::var("KUBERNETES_SERVICE_HOST"),
            env::var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return Ok(None);
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = read_file(&dir.join("token"))?;
        let ca_pem = read_file(&dir.join("ca.crt"))?;
        let namespace = fs::read_to_string(dir.join("namespace"))
            .ok()
            .map(|ns| ns.trim().to_string());

        // IPv6 service hosts need brackets
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        Ok(Some(Self {
            server: parse_server(&format!("https://{host}:{port}"))?,
            namespace,
            token: Some(String::from_utf8_lossy(&token).trim().to_string()),
            ca_pem: Some(ca_pem),
            identity: None,
            insecure: false,
        }))
    }

    pub fn from_kubeconfig(path: &Path) -> ClusterResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("failed to read kubeconfig {}: {e}", path.display()))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse_kubeconfig(&contents, base_dir)
    }

    /// Parses kubeconfig YAML. Relative file references resolve against `base_dir`.
    pub fn parse_kubeconfig(contents: &str, base_dir: &Path) -> ClusterResult<Self> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(contents)
            .map_err(|e| ClusterError::Config(format!("invalid kubeconfig: {e}")))?;

        let context = match kubeconfig.current_context.as_deref() {
            Some(name) => kubeconfig
                .contexts
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| ClusterError::Config(format!("context {name} not found")))?,
            None => kubeconfig
                .contexts
                .first()
                .ok_or_else(|| ClusterError::Config("kubeconfig has no contexts".to_string()))?,
        };

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                ClusterError::Config(format!("cluster {} not found", context.context.cluster))
            })?;

        let user = match context.context.user.as_deref() {
            Some(name) => kubeconfig
                .users
                .iter()
                .find(|u| u.name == name)
                .map(|u| u.user.clone())
                .ok_or_else(|| ClusterError::Config(format!("user {name} not found")))?,
            None => UserEntry::default(),
        };

        let ca_pem = load_material(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
        )?;

        let token = match (user.token, user.token_file) {
            (Some(token), _) => Some(token),
            (None, Some(file)) => {
                let raw = read_file(&resolve(base_dir, &file))?;
                Some(String::from_utf8_lossy(&raw).trim().to_string())
            }
            (None, None) => None,
        };

        let cert = load_material(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base_dir,
        )?;
        let key = load_material(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            base_dir,
        )?;
        let identity = match (cert, key) {
            (Some(cert_pem), Some(key_pem)) => Some(ClientIdentity { cert_pem, key_pem }),
            (None, None) => None,
            _ => {
                return Err(ClusterError::Config(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        };

        Ok(Self {
            server: parse_server(&cluster.server)?,
            namespace: context.context.namespace.clone(),
            token,
            ca_pem,
            identity,
            insecure: cluster.insecure_skip_tls_verify,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    current_context: Option<String>,
}

#[derive(Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
}

#[derive(Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Deserialize)]
struct ContextEntry {
    cluster: String,
    user: Option<String>,
    namespace: Option<String>,
}

fn parse_server(raw: &str) -> ClusterResult<Url> {
    Url::parse(raw).map_err(|e| ClusterError::Config(format!("invalid server URL {raw}: {e}")))
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn read_file(path: &Path) -> ClusterResult<Vec<u8>> {
    fs::read(path).map_err(|e| ClusterError::Config(format!("failed to read {}: {e}", path.display())))
}

/// Inline base64 data wins over a file reference.
fn load_material(
    data: Option<&str>,
    file: Option<&Path>,
    base_dir: &Path,
) -> ClusterResult<Option<Vec<u8>>> {
    if let Some(data) = data {
        let decoded = STANDARD
            .decode(data.trim())
            .map_err(|e| ClusterError::Config(format!("invalid base64 in kubeconfig: {e}")))?;
        return Ok(Some(decoded));
    }
    file.map(|f| read_file(&resolve(base_dir, f))).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
  - name: prod
    cluster:
      server: https://prod.example.com
  - name: dev
    cluster:
      server: https://127.0.0.1:6443
      certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t
contexts:
  - name: prod
    context:
      cluster: prod
      user: admin
  - name: dev
    context:
      cluster: dev
      user: developer
      namespace: shells
users:
  - name: admin
    user:
      token: prod-token
  - name: developer
    user:
      token: dev-token
"#;

    #[test]
    fn follows_current_context() {
        let config = ClusterConfig::parse_kubeconfig(KUBECONFIG, Path::new("/tmp")).unwrap();
        assert_eq!(config.server.as_str(), "https://127.0.0.1:6443/");
        assert_eq!(config.namespace.as_deref(), Some("shells"));
        assert_eq!(config.token.as_deref(), Some("dev-token"));
        assert_eq!(
            config.ca_pem.as_deref(),
            Some(b"-----BEGIN CERTIFICATE-----".as_slice())
        );
        assert!(config.identity.is_none());
        assert!(!config.insecure);
    }

    #[test]
    fn resolves_relative_files_against_kubeconfig_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut token = fs::File::create(dir.path().join("token")).unwrap();
        writeln!(token, "file-token").unwrap();
        fs::write(dir.path().join("client.crt"), "CERT").unwrap();
        fs::write(dir.path().join("client.key"), "KEY").unwrap();

        let path = dir.path().join("config");
        fs::write(
            &path,
            r#"
current-context: local
clusters:
  - name: local
    cluster:
      server: https://localhost:8443
      insecure-skip-tls-verify: true
contexts:
  - name: local
    context:
      cluster: local
      user: me
users:
  - name: me
    user:
      tokenFile: token
      client-certificate: client.crt
      client-key: client.key
"#,
        )
        .unwrap();

        let config = ClusterConfig::from_kubeconfig(&path).unwrap();
        assert!(config.insecure);
        assert_eq!(config.token.as_deref(), Some("file-token"));
        let identity = config.identity.unwrap();
        assert_eq!(identity.cert_pem, b"CERT");
        assert_eq!(identity.key_pem, b"KEY");
    }

    #[test]
    fn missing_context_is_a_config_error() {
        let yaml = KUBECONFIG.replace("current-context: dev", "current-context: staging");
        let err = ClusterConfig::parse_kubeconfig(&yaml, Path::new("/tmp"))
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Config(ref m) if m.contains("staging")));
    }

    #[test]
    fn half_configured_client_identity_is_rejected() {
        let yaml = r#"
clusters:
  - name: c
    cluster:
      server: https://k8s.local
contexts:
  - name: c
    context:
      cluster: c
      user: u
users:
  - name: u
    user:
      client-certificate-data: Q0VSVA==
"#;
        assert!(ClusterConfig::parse_kubeconfig(yaml, Path::new("/tmp")).is_err());
    }
}
