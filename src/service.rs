use crate::bridge::{run_bridge, BridgeOptions, Keepalive};
use crate::cluster::{ClusterApi, ExecRequest};
use crate::errors::{ShellError, ShellResult};
use crate::models::{ControlFrame, SandboxPhase, SessionInfo, TerminalSize, CONTAINER_NAME};
use crate::sandbox::progress::format_elapsed;
use crate::sandbox::{sanitize_owner, SandboxManager, StatusSink};
use crate::session::{new_session_id, Session, SessionRegistry};
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{Sink, SinkExt, Stream};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Fragments of exec failures that mean the image has no usable shell.
const MISSING_SHELL_MARKERS: [&str; 4] = [
    "no such file or directory",
    "exec:",
    "executable file not found",
    "no shell found",
];

/// Parameters of one terminal WebSocket connection.
#[derive(Clone, Debug, Default)]
pub struct TerminalRequest {
    pub session_id: Option<String>,
    pub reconnect: bool,
    pub owner: String,
    pub size: Option<TerminalSize>,
}

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    /// Program started for every terminal.
    pub shell: String,
    /// Shown in the ready banner.
    pub namespace: String,
    pub bridge: BridgeOptions,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            shell: crate::DEFAULT_SHELL.to_string(),
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            bridge: BridgeOptions::default(),
        }
    }
}

#[async_trait]
pub trait TerminalService: Send + Sync + 'static {
    /// Drives one terminal connection to completion.
    async fn attach(&self, socket: WebSocket, request: TerminalRequest);
    async fn session(&self, id: &str) -> ShellResult<SessionInfo>;
    async fn teardown_session(&self, id: &str) -> ShellResult<()>;
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn TerminalService>,
}

impl AppState {
    pub fn new(service: Arc<dyn TerminalService>) -> Self {
        Self { service }
    }
}

#[allow(dead_code)]
fn assert_app_state_bounds() {
    fn assert_state<T: Clone + Send + Sync + 'static>() {}
    assert_state::<AppState>();
}

/// Releases the exec gate and marks the session detached, however the
/// bridge ends.
struct AttachGuard<'a> {
    registry: &'a SessionRegistry,
    session_id: &'a str,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.registry.unlock_exec(self.session_id);
        self.registry.set_active(self.session_id, false);
    }
}

/// Heartbeats the sandbox and counts the session as used.
pub struct SessionKeepalive {
    sandboxes: Arc<SandboxManager>,
    registry: Arc<SessionRegistry>,
    sandbox: String,
    session_id: String,
}

#[async_trait]
impl Keepalive for SessionKeepalive {
    async fn refresh(&self) {
        self.sandboxes.heartbeat(&self.sandbox).await;
        self.registry.touch(&self.session_id);
    }
}

pub struct ShellService {
    registry: Arc<SessionRegistry>,
    sandboxes: Arc<SandboxManager>,
    api: Arc<dyn ClusterApi>,
    options: ServiceOptions,
    shutdown: CancellationToken,
}

impl ShellService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sandboxes: Arc<SandboxManager>,
        api: Arc<dyn ClusterApi>,
        options: ServiceOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            sandboxes,
            api,
            options,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Resolves the session for a connection. A reconnect keeps the session
    /// but still goes through the lifecycle manager, so a sandbox reaped
    /// while the client was away is recreated. Otherwise a new session is
    /// created, backed by the owner's sandbox.
    ///
    /// Reconnecting to another owner's session is reported as
    /// [`ShellError::SessionNotFound`].
    pub async fn ensure_session(
        &self,
        existing_id: Option<&str>,
        reconnect: bool,
        owner: &str,
        status: &StatusSink<'_>,
    ) -> ShellResult<Session> {
        if let (Some(id), true) = (existing_id, reconnect) {
            return self.resume_session(id, owner, status).await;
        }

        let id = new_session_id();
        let sandbox = self.sandboxes.ensure_sandbox(owner, &id, status).await?;
        let session = self
            .registry
            .create_with_id(id, &sandbox.owner, &sandbox.name);
        info!(session_id = %session.id, sandbox = %session.sandbox_ref, "session created");
        Ok(session)
    }

    async fn resume_session(
        &self,
        id: &str,
        owner: &str,
        status: &StatusSink<'_>,
    ) -> ShellResult<Session> {
        let not_found = || ShellError::SessionNotFound(id.to_string());
        let session = self.registry.get(id).ok_or_else(not_found)?;
        if sanitize_owner(owner) != session.owner {
            warn!(session_id = %id, owner = %owner, "reconnect by a different owner refused");
            return Err(not_found());
        }

        if let Ok(Some(sandbox)) = self.sandboxes.find_existing(&session.owner).await {
            if sandbox.name == session.sandbox_ref {
                return Ok(session);
            }
        }

        info!(session_id = %id, "sandbox missing on reconnect, ensuring a new one");
        let sandbox = self
            .sandboxes
            .ensure_sandbox(&session.owner, &session.id, status)
            .await?;
        self.registry
            .rebind(id, &sandbox.name)
            .ok_or_else(not_found)
    }

    /// Claims the session's exec gate and relays the socket to a shell in its
    /// sandbox until either side goes away. For new sessions the
    /// session-info frame is sent first and its echo is dropped.
    ///
    /// Fails with [`ShellError::ExecLocked`] without touching the socket when
    /// another connection already holds the session.
    pub async fn attach_bridge<S, E>(
        &self,
        session: &Session,
        socket: &mut S,
        size: Option<TerminalSize>,
        new_session: bool,
    ) -> ShellResult<()>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin + Send,
        E: Display + Send,
    {
        if !self.registry.try_lock_exec(&session.id) {
            warn!(session_id = %session.id, "session exec already locked, rejecting connection");
            return Err(ShellError::ExecLocked(session.id.clone()));
        }
        let _guard = AttachGuard {
            registry: &self.registry,
            session_id: &session.id,
        };
        self.registry.set_active(&session.id, true);

        if new_session {
            let frame = ControlFrame::Session {
                session_id: session.id.clone(),
                sandbox: session.sandbox_ref.clone(),
            };
            let text = serde_json::to_string(&frame)
                .map_err(|e| ShellError::Internal(e.to_string()))?;
            tokio::time::timeout(
                self.options.bridge.write_timeout,
                socket.send(Message::Text(text.into())),
            )
            .await
            .map_err(|_| ShellError::Exec("timed out sending session info".to_string()))?
            .map_err(|e| ShellError::Exec(format!("failed to send session info: {e}")))?;
        }

        let sandbox = self.sandboxes.get(&session.sandbox_ref).await?;
        if sandbox.phase != SandboxPhase::Running || sandbox.terminating {
            return Err(ShellError::SandboxNotRunning {
                name: sandbox.name,
                phase: sandbox.phase.to_string(),
            });
        }

        let exec = self
            .api
            .exec(ExecRequest {
                sandbox: sandbox.name.clone(),
                container: CONTAINER_NAME.to_string(),
                command: vec![self.options.shell.clone()],
                initial_size: size,
            })
            .await
            .map_err(|e| ShellError::Exec(e.to_string()))?;

        info!(session_id = %session.id, sandbox = %sandbox.name, "starting terminal stream");

        let keepalive = SessionKeepalive {
            sandboxes: self.sandboxes.clone(),
            registry: self.registry.clone(),
            sandbox: sandbox.name.clone(),
            session_id: session.id.clone(),
        };
        let options = BridgeOptions {
            skip_session_frame: new_session,
            ..self.options.bridge.clone()
        };
        let connection = self.shutdown.child_token();

        let outcome = run_bridge(socket, exec, &keepalive, &options, &connection).await;
        info!(session_id = %session.id, sandbox = %sandbox.name, "terminal stream ended");
        outcome
    }

    /// Deletes the session's sandbox, then forgets the session.
    pub async fn teardown_session(&self, id: &str) -> ShellResult<()> {
        let session = self
            .registry
            .peek(id)
            .ok_or_else(|| ShellError::SessionNotFound(id.to_string()))?;

        self.sandboxes.delete(&session.sandbox_ref).await?;
        self.registry.delete(id);
        info!(session_id = %id, sandbox = %session.sandbox_ref, "session torn down");
        Ok(())
    }

    /// Full lifecycle of a terminal connection: provisioning with live
    /// progress, exec-gate handling, the bridge, and a closing message.
    pub async fn serve_terminal<S, E>(&self, socket: &mut S, request: TerminalRequest)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin + Send,
        E: Display + Send,
    {
        let reconnecting = request.reconnect && request.session_id.is_some();

        let Some(session) = self.provision(socket, &request, reconnecting).await else {
            return;
        };

        info!(session_id = %session.id, sandbox = %session.sandbox_ref, "terminal connection established");

        match self
            .attach_bridge(&session, socket, request.size, !reconnecting)
            .await
        {
            Ok(()) => close(socket, close_code::NORMAL, "").await,
            Err(ShellError::ExecLocked(_)) => {
                close(socket, close_code::POLICY, "Session already has an active connection").await
            }
            Err(err @ (ShellError::SandboxNotFound(_) | ShellError::SandboxNotRunning { .. })) => {
                error!(session_id = %session.id, error = %err, "sandbox unavailable");
                let reason = match err {
                    ShellError::SandboxNotFound(_) => "Sandbox not found",
                    _ => "Sandbox not running",
                };
                close(socket, close_code::ERROR, reason).await;
            }
            Err(err) => {
                error!(session_id = %session.id, error = %err, "terminal stream error");
                let message = describe_exec_failure(&err.to_string(), &self.sandboxes.config().image);
                send_line(socket, &format!("Exec error: {message}")).await;
                close(socket, close_code::ERROR, "Exec error").await;
            }
        }
    }

    /// Resolves the session while streaming progress lines to the socket.
    /// New sessions get the startup banner and a ready summary; reconnects
    /// only show progress when their sandbox has to be recreated.
    /// `None` means it failed and the socket has been closed.
    async fn provision<S, E>(
        &self,
        socket: &mut S,
        request: &TerminalRequest,
        reconnecting: bool,
    ) -> Option<Session>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin + Send,
        E: Display + Send,
    {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let sink = move |line: &str| {
            let _ = tx.send(line.to_string());
        };

        if !reconnecting {
            sink(&format!("\r\n\x1b[36m{SEPARATOR}\x1b[0m\r\n"));
            sink("\x1b[34;1mKubeshell is starting up\x1b[0m\r\n");
            sink(&format!("\x1b[36m{SEPARATOR}\x1b[0m\r\n\r\n"));
        }

        let ensure = async move {
            self.ensure_session(
                request.session_id.as_deref(),
                reconnecting,
                &request.owner,
                &sink,
            )
            .await
        };
        let forward = async {
            let mut forwarded = 0usize;
            while let Some(line) = rx.recv().await {
                send_line(socket, &line).await;
                forwarded += 1;
            }
            forwarded
        };
        let (result, forwarded) = tokio::join!(ensure, forward);

        let elapsed = format_elapsed(started.elapsed());
        match result {
            Ok(session) if reconnecting => {
                if forwarded > 0 {
                    send_line(socket, "\r\x1b[K\x1b[32m[✓] Terminal session ready\x1b[0m\r\n").await;
                }
                Some(session)
            }
            Ok(session) => {
                send_line(socket, "\r\x1b[K\x1b[32m[✓] Terminal session ready\x1b[0m\r\n").await;
                send_line(socket, &format!("\r\n\x1b[36m{SEPARATOR}\x1b[0m\r\n")).await;
                send_line(socket, &format!("\x1b[36m✓ Ready in {elapsed}\x1b[0m\r\n")).await;
                send_line(
                    socket,
                    &format!(
                        "\x1b[90mSandbox: {} | Namespace: {}\x1b[0m\r\n\r\n",
                        session.sandbox_ref, self.options.namespace
                    ),
                )
                .await;
                Some(session)
            }
            Err(err @ ShellError::SessionNotFound(_)) => {
                info!(error = %err, "reconnect to unknown session");
                send_line(socket, &format!("\r\n\x1b[31m[✗] {err}\x1b[0m\r\n")).await;
                close(socket, close_code::POLICY, "Session not found").await;
                None
            }
            Err(err) => {
                error!(owner = %request.owner, error = %err, "failed to provision sandbox");
                send_line(
                    socket,
                    &format!(
                        "\r\n\x1b[31m[✗] Failed to create sandbox: {err} (took {elapsed})\x1b[0m\r\n"
                    ),
                )
                .await;
                close(socket, close_code::ERROR, "Failed to create sandbox").await;
                None
            }
        }
    }
}

#[async_trait]
impl TerminalService for ShellService {
    async fn attach(&self, mut socket: WebSocket, request: TerminalRequest) {
        self.serve_terminal(&mut socket, request).await;
    }

    async fn session(&self, id: &str) -> ShellResult<SessionInfo> {
        self.registry
            .get(id)
            .map(|s| s.to_info())
            .ok_or_else(|| ShellError::SessionNotFound(id.to_string()))
    }

    async fn teardown_session(&self, id: &str) -> ShellResult<()> {
        ShellService::teardown_session(self, id).await
    }
}

/// User-facing text for a failed exec; a missing shell gets a clearer hint.
pub fn describe_exec_failure(message: &str, image: &str) -> String {
    let lowered = message.to_lowercase();
    if MISSING_SHELL_MARKERS.iter().any(|m| lowered.contains(m)) {
        format!("No interactive shell available in this sandbox (image: {image})")
    } else {
        message.to_string()
    }
}

async fn send_line<S, E>(socket: &mut S, line: &str)
where
    S: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    match tokio::time::timeout(STATUS_WRITE_TIMEOUT, socket.send(Message::Text(line.into()))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "failed to write status line"),
        Err(_) => debug!("status line write timed out"),
    }
}

async fn close<S, E>(socket: &mut S, code: u16, reason: &str)
where
    S: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "failed to send close frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_shell_is_explained() {
        let message = describe_exec_failure(
            r#"exec stream error: exec: "/bin/sh": stat /bin/sh: no such file or directory"#,
            "gcr.io/distroless/static",
        );
        assert_eq!(
            message,
            "No interactive shell available in this sandbox (image: gcr.io/distroless/static)"
        );

        let message = describe_exec_failure("exec stream error: connection reset", "busybox");
        assert_eq!(message, "exec stream error: connection reset");
    }
}
