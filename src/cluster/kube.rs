//! [`ClusterApi`] over the Kubernetes REST API.
//!
//! Plain JSON over `reqwest` for pods and claims; interactive exec speaks the
//! `v4.channel.k8s.io` WebSocket subprotocol, where the first byte of every
//! binary frame names the stream.

use super::kubeconfig::ClusterConfig;
use super::{
    ClusterApi, ClusterError, ClusterResult, ExecChannel, ExecEvent, ExecRequest, ExecStatus,
};
use crate::models::{
    ownership_labels, Sandbox, SandboxPhase, SandboxSpec, TerminalSize, VolumeSpec,
    CONTAINER_NAME, HEARTBEAT_ANNOTATION, LABEL_OWNER, LABEL_SESSION,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::Connector;
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";

const STDIN_CHANNEL: u8 = 0;
const STDOUT_CHANNEL: u8 = 1;
const STDERR_CHANNEL: u8 = 2;
const STATUS_CHANNEL: u8 = 3;
const RESIZE_CHANNEL: u8 = 4;

const HOME_VOLUME: &str = "home";
const CONTAINER_HOSTNAME: &str = "kubeshell";
const USER_ENV: &str = "KUBESHELL_USER";

pub struct KubeClient {
    http: reqwest::Client,
    server: String,
    namespace: String,
    token: Option<String>,
    ws_tls: Option<Arc<rustls::ClientConfig>>,
}

impl KubeClient {
    pub fn new(config: &ClusterConfig, namespace: &str) -> ClusterResult<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(ca) = &config.ca_pem {
            let certs = reqwest::Certificate::from_pem_bundle(ca)
                .map_err(|e| ClusterError::Config(format!("invalid CA bundle: {e}")))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let Some(identity) = &config.identity {
            let pem = [identity.key_pem.as_slice(), b"\n", identity.cert_pem.as_slice()].concat();
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ClusterError::Config(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| ClusterError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            server: config.server.as_str().trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token: config.token.clone(),
            ws_tls: websocket_tls(config)?,
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.server, self.namespace)
    }

    fn pod_url(&self, name: &str) -> String {
        format!("{}/{name}", self.pods_url())
    }

    fn claim_url(&self, name: Option<&str>) -> String {
        let base = format!(
            "{}/api/v1/namespaces/{}/persistentvolumeclaims",
            self.server, self.namespace
        );
        match name {
            Some(name) => format!("{base}/{name}"),
            None => base,
        }
    }

    fn exec_url(&self, request: &ExecRequest) -> ClusterResult<Url> {
        let base = self
            .server
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let mut url = Url::parse(&format!(
            "{base}/api/v1/namespaces/{}/pods/{}/exec",
            self.namespace, request.sandbox
        ))
        .map_err(|e| ClusterError::Config(format!("invalid exec URL: {e}")))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("container", &request.container);
            for arg in &request.command {
                query.append_pair("command", arg);
            }
            query
                .append_pair("stdin", "true")
                .append_pair("stdout", "true")
                .append_pair("stderr", "true")
                .append_pair("tty", "true");
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends the request and turns non-2xx responses into [`ClusterError`]s.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> ClusterResult<reqwest::Response> {
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, kind, name))
    }
}

fn status_error(status: StatusCode, body: &str, kind: &'static str, name: &str) -> ClusterError {
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        StatusCode::CONFLICT => ClusterError::Conflict {
            kind,
            name: name.to_string(),
        },
        _ => {
            let message = serde_json::from_str::<ApiStatus>(body)
                .ok()
                .and_then(|s| s.message)
                .unwrap_or_else(|| body.trim().to_string());
            ClusterError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_sandbox(&self, name: &str) -> ClusterResult<Option<Sandbox>> {
        let request = self.request(Method::GET, &self.pod_url(name));
        match self.send(request, "pod", name).await {
            Ok(response) => Ok(Some(response.json::<PodObject>().await?.into())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ClusterResult<Sandbox> {
        let request = self
            .request(Method::POST, &self.pods_url())
            .json(&pod_manifest(spec));
        let response = self.send(request, "pod", &spec.name).await?;
        Ok(response.json::<PodObject>().await?.into())
    }

    async fn delete_sandbox(&self, name: &str) -> ClusterResult<()> {
        let request = self
            .request(Method::DELETE, &self.pod_url(name))
            .json(&json!({ "propagationPolicy": "Foreground" }));
        self.send(request, "pod", name).await?;
        Ok(())
    }

    async fn list_sandboxes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<Sandbox>> {
        let request = self
            .request(Method::GET, &self.pods_url())
            .query(&[("labelSelector", super::selector_string(selector))]);
        let list: PodList = self.send(request, "pod", "*").await?.json().await?;
        Ok(list.items.into_iter().map(Sandbox::from).collect())
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let body = json!({ "metadata": { "annotations": annotations } });
        let request = self
            .request(Method::PATCH, &self.pod_url(name))
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(body.to_string());
        self.send(request, "pod", name).await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> ClusterResult<bool> {
        let request = self.request(Method::GET, &self.claim_url(Some(name)));
        match self.send(request, "persistentvolumeclaim", name).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> ClusterResult<()> {
        let request = self
            .request(Method::POST, &self.claim_url(None))
            .json(&claim_manifest(spec));
        self.send(request, "persistentvolumeclaim", &spec.name)
            .await?;
        Ok(())
    }

    async fn exec(&self, request: ExecRequest) -> ClusterResult<ExecChannel> {
        let url = self.exec_url(&request)?;
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClusterError::Protocol(e.to_string()))?;
        let headers = ws_request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_PROTOCOL));
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClusterError::Config(format!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let connector = self.ws_tls.clone().map(Connector::Rustls);
        let connect =
            tokio_tungstenite::connect_async_tls_with_config(ws_request, None, false, connector);
        let (stream, _) = tokio::time::timeout(REQUEST_TIMEOUT, connect)
            .await
            .map_err(|_| ClusterError::Timeout(REQUEST_TIMEOUT))?
            .map_err(|e| upgrade_error(e, &request.sandbox))?;

        debug!(sandbox = %request.sandbox, "exec stream opened");

        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(64);
        tokio::spawn(pump(
            stream,
            stdin_rx,
            resize_rx,
            events_tx,
            request.initial_size,
        ));

        Ok(ExecChannel {
            stdin: stdin_tx,
            resize: resize_tx,
            events: events_rx,
        })
    }
}

fn upgrade_error(error: tungstenite::Error, sandbox: &str) -> ClusterError {
    match error {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            status_error(status, &body, "pod", sandbox)
        }
        other => ClusterError::Transport(other.to_string()),
    }
}

fn resize_frame(size: TerminalSize) -> Message {
    let mut frame = vec![RESIZE_CHANNEL];
    frame.extend_from_slice(
        json!({ "Width": size.cols, "Height": size.rows })
            .to_string()
            .as_bytes(),
    );
    Message::Binary(frame)
}

/// Moves bytes between the exec WebSocket and the channel handed to the caller
/// until either side goes away, then reports how the process ended.
async fn pump<S>(
    stream: S,
    mut stdin: mpsc::Receiver<Vec<u8>>,
    mut resize: mpsc::Receiver<TerminalSize>,
    events: mpsc::Sender<ExecEvent>,
    initial_size: Option<TerminalSize>,
) where
    S: futures::Stream<Item = Result<Message, tungstenite::Error>>
        + futures::Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let mut status = None;

    if let Some(size) = initial_size {
        if let Err(err) = sink.send(resize_frame(size)).await {
            warn!(error = %err, "failed to send initial terminal size");
        }
    }

    loop {
        tokio::select! {
            input = stdin.recv() => match input {
                Some(bytes) => {
                    let mut frame = Vec::with_capacity(bytes.len() + 1);
                    frame.push(STDIN_CHANNEL);
                    frame.extend_from_slice(&bytes);
                    if let Err(err) = sink.send(Message::Binary(frame)).await {
                        status = Some(ExecStatus::Failure(err.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            Some(size) = resize.recv() => {
                if let Err(err) = sink.send(resize_frame(size)).await {
                    debug!(error = %err, "failed to forward resize");
                }
            }
            message = source.next() => match message {
                Some(Ok(Message::Binary(frame))) => match frame.split_first() {
                    Some((&STDOUT_CHANNEL | &STDERR_CHANNEL, payload)) if !payload.is_empty() => {
                        if events.send(ExecEvent::Output(payload.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some((&STATUS_CHANNEL, payload)) => {
                        status = Some(parse_exec_status(payload));
                    }
                    _ => {}
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    status.get_or_insert(ExecStatus::Failure(err.to_string()));
                    break;
                }
            }
        }
    }

    let _ = events
        .send(ExecEvent::Exit(status.unwrap_or(ExecStatus::Success)))
        .await;
}

/// Decodes the `Status` object the API server writes on the status channel.
pub fn parse_exec_status(payload: &[u8]) -> ExecStatus {
    let Ok(status) = serde_json::from_slice::<ApiStatus>(payload) else {
        return ExecStatus::Failure(String::from_utf8_lossy(payload).trim().to_string());
    };

    if status.status.as_deref() == Some("Success") {
        return ExecStatus::Success;
    }

    let exit_code = status
        .details
        .iter()
        .flat_map(|d| d.causes.iter())
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse::<i32>().ok());

    match exit_code {
        Some(code) => ExecStatus::ExitCode(code),
        None => ExecStatus::Failure(
            status
                .message
                .unwrap_or_else(|| "command failed without a message".to_string()),
        ),
    }
}

fn pod_manifest(spec: &SandboxSpec) -> serde_json::Value {
    let mut labels = ownership_labels();
    labels.insert(LABEL_OWNER.to_string(), spec.owner.clone());
    labels.insert(LABEL_SESSION.to_string(), spec.session_id.clone());

    let annotations = BTreeMap::from([(
        HEARTBEAT_ANNOTATION.to_string(),
        spec.heartbeat.to_rfc3339(),
    )]);
    let resources = json!({ "cpu": spec.cpu, "memory": spec.memory });

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": {
            "hostname": CONTAINER_HOSTNAME,
            "serviceAccountName": spec.service_account,
            "restartPolicy": "Never",
            "containers": [{
                "name": CONTAINER_NAME,
                "image": spec.image,
                "imagePullPolicy": "IfNotPresent",
                "env": [{ "name": USER_ENV, "value": spec.owner }],
                "resources": { "limits": resources, "requests": resources },
                "volumeMounts": [{
                    "name": HOME_VOLUME,
                    "mountPath": format!("/home/{}", spec.owner),
                }],
            }],
            "volumes": [{
                "name": HOME_VOLUME,
                "persistentVolumeClaim": { "claimName": spec.home_volume },
            }],
        },
    })
}

fn claim_manifest(spec: &VolumeSpec) -> serde_json::Value {
    let mut labels = ownership_labels();
    labels.insert(LABEL_OWNER.to_string(), spec.owner.clone());

    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": spec.name, "labels": labels },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": spec.size } },
        },
    })
}

#[derive(Deserialize)]
struct ApiStatus {
    status: Option<String>,
    message: Option<String>,
    details: Option<StatusDetails>,
}

#[derive(Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Deserialize)]
struct StatusCause {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodObject>,
}

#[derive(Deserialize)]
struct PodObject {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Option<PodSpecObject>,
    #[serde(default)]
    status: Option<PodStatusObject>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    creation_timestamp: Option<DateTime<Utc>>,
    deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct PodSpecObject {
    #[serde(default)]
    volumes: Vec<VolumeObject>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeObject {
    persistent_volume_claim: Option<ClaimSource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimSource {
    claim_name: String,
}

#[derive(Deserialize)]
struct PodStatusObject {
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl From<PodObject> for Sandbox {
    fn from(pod: PodObject) -> Self {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(SandboxPhase::parse)
            .unwrap_or(SandboxPhase::Pending);
        let ready = pod.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
        });
        let home_volume = pod.spec.and_then(|spec| {
            spec.volumes
                .into_iter()
                .find_map(|v| v.persistent_volume_claim.map(|c| c.claim_name))
        });

        Sandbox {
            owner: pod
                .metadata
                .labels
                .get(LABEL_OWNER)
                .cloned()
                .unwrap_or_default(),
            name: pod.metadata.name,
            phase,
            ready,
            terminating: pod.metadata.deletion_timestamp.is_some(),
            created_at: pod.metadata.creation_timestamp.unwrap_or_else(Utc::now),
            home_volume,
            labels: pod.metadata.labels,
            annotations: pod.metadata.annotations,
        }
    }
}

/// TLS settings for the exec WebSocket, mirroring what the HTTP client trusts.
/// `None` leaves the connector's default roots in place.
fn websocket_tls(config: &ClusterConfig) -> ClusterResult<Option<Arc<rustls::ClientConfig>>> {
    if config.ca_pem.is_none() && config.identity.is_none() && !config.insecure {
        return Ok(None);
    }

    let tls_error = |e: rustls::Error| ClusterError::Config(format!("TLS setup failed: {e}"));
    let pem_error = |e: rustls_pki_types::pem::Error| {
        ClusterError::Config(format!("invalid PEM material: {e:?}"))
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = if config.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca) = &config.ca_pem {
            for cert in CertificateDer::pem_slice_iter(ca) {
                roots.add(cert.map_err(pem_error)?).map_err(tls_error)?;
            }
        }
        builder.with_root_certificates(roots)
    };

    let tls = match &config.identity {
        Some(identity) => {
            let certs = CertificateDer::pem_slice_iter(&identity.cert_pem)
                .collect::<Result<Vec<_>, _>>()
                .map_err(pem_error)?;
            let key = PrivateKeyDer::from_pem_slice(&identity.key_pem).map_err(pem_error)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(tls_error)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Some(Arc::new(tls)))
}

/// Honors `insecure-skip-tls-verify`: any server certificate is accepted, but
/// handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KubeClient {
        let config = ClusterConfig {
            server: Url::parse("https://k8s.example.com:6443/").unwrap(),
            namespace: None,
            token: Some("secret".to_string()),
            ca_pem: None,
            identity: None,
            insecure: false,
        };
        KubeClient::new(&config, "shells").unwrap()
    }

    #[test]
    fn exec_url_targets_terminal_container_with_tty() {
        let url = client()
            .exec_url(&ExecRequest {
                sandbox: "kubeshell-alice".to_string(),
                container: "terminal".to_string(),
                command: vec!["/bin/sh".to_string()],
                initial_size: None,
            })
            .unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(
            url.path(),
            "/api/v1/namespaces/shells/pods/kubeshell-alice/exec"
        );
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("container".into(), "terminal".into())));
        assert!(query.contains(&("command".into(), "/bin/sh".into())));
        assert!(query.contains(&("tty".into(), "true".into())));
        assert!(query.contains(&("stdin".into(), "true".into())));
    }

    #[test]
    fn exec_status_decoding() {
        assert_eq!(
            parse_exec_status(br#"{"metadata":{},"status":"Success"}"#),
            ExecStatus::Success
        );

        let killed = br#"{"status":"Failure","message":"command terminated with non-zero exit code: error executing command [/bin/sh], exit code 137","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"137"}]}}"#;
        assert_eq!(parse_exec_status(killed), ExecStatus::ExitCode(137));

        let failure = br#"{"status":"Failure","message":"exec: \"/bin/bash\": stat /bin/bash: no such file or directory"}"#;
        assert!(matches!(
            parse_exec_status(failure),
            ExecStatus::Failure(m) if m.contains("no such file or directory")
        ));
    }

    #[test]
    fn pod_json_maps_to_sandbox() {
        let raw = r#"{
            "metadata": {
                "name": "kubeshell-alice",
                "labels": {"app": "kubeshell", "owner": "alice"},
                "annotations": {"kubeshell.io/last-heartbeat": "2024-05-01T10:00:00Z"},
                "creationTimestamp": "2024-05-01T09:00:00Z",
                "deletionTimestamp": "2024-05-01T11:00:00Z"
            },
            "spec": {
                "volumes": [
                    {"name": "token", "projected": {}},
                    {"name": "home", "persistentVolumeClaim": {"claimName": "kubeshell-home-alice"}}
                ]
            },
            "status": {
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        }"#;
        let sandbox: Sandbox = serde_json::from_str::<PodObject>(raw).unwrap().into();

        assert_eq!(sandbox.name, "kubeshell-alice");
        assert_eq!(sandbox.owner, "alice");
        assert_eq!(sandbox.phase, SandboxPhase::Running);
        assert!(sandbox.ready);
        assert!(sandbox.terminating);
        assert!(!sandbox.is_reusable());
        assert_eq!(sandbox.home_volume.as_deref(), Some("kubeshell-home-alice"));
        assert_eq!(
            sandbox.last_heartbeat().unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }

    #[test]
    fn api_errors_keep_server_message() {
        let err = status_error(
            StatusCode::FORBIDDEN,
            r#"{"kind":"Status","message":"pods is forbidden"}"#,
            "pod",
            "kubeshell-alice",
        );
        assert!(matches!(err, ClusterError::Api { status: 403, ref message } if message == "pods is forbidden"));
        assert!(status_error(StatusCode::NOT_FOUND, "", "pod", "x").is_not_found());
    }

    #[test]
    fn manifest_mounts_owner_home() {
        let spec = SandboxSpec {
            name: "kubeshell-alice".into(),
            owner: "alice".into(),
            session_id: "s-1".into(),
            image: "bitnami/kubectl:latest".into(),
            service_account: "kubectl-pod".into(),
            cpu: "500m".into(),
            memory: "512Mi".into(),
            home_volume: "kubeshell-home-alice".into(),
            heartbeat: Utc::now(),
        };
        let manifest = pod_manifest(&spec);
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["name"], "terminal");
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/home/alice");
        assert_eq!(container["resources"]["limits"]["cpu"], "500m");
        assert_eq!(manifest["metadata"]["labels"]["app"], "kubeshell");
        assert_eq!(manifest["metadata"]["labels"]["session-id"], "s-1");
        assert_eq!(manifest["spec"]["restartPolicy"], "Never");
    }
}
