//! Relays a client WebSocket to an interactive exec channel.
//!
//! Three loops run concurrently on one task and share a cancellation token:
//! inbound (client frames to process stdin), outbound (process output to
//! binary frames), and liveness (WebSocket pings plus sandbox heartbeats).
//! Whichever loop notices the end first cancels the others.

use crate::cluster::{ExecChannel, ExecEvent, ExecStatus, KILLED_EXIT_CODE};
use crate::errors::{ShellError, ShellResult};
use crate::models::{ControlFrame, TerminalSize};
use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session-info frames are small; anything larger is terminal input.
const CONTROL_FRAME_LIMIT: usize = 200;

/// Refreshes liveness state for the sandbox behind a bridge.
#[async_trait]
pub trait Keepalive: Send + Sync {
    async fn refresh(&self);
}

#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Delay before the first keep-alive ping.
    pub ping_grace: Duration,
    pub ping_interval: Duration,
    /// A ping that cannot be written within this bound means the peer is gone.
    pub ping_timeout: Duration,
    /// Inbound reads wake at least this often to notice cancellation.
    pub read_poll: Duration,
    /// Longest the client may stay completely silent.
    pub peer_silence: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Drop the client's echo of the session-info frame (new sessions only).
    pub skip_session_frame: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            ping_grace: Duration::from_millis(500),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_millis(500),
            read_poll: Duration::from_secs(2),
            peer_silence: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            skip_session_frame: false,
        }
    }
}

type Writer<'a, S> = Mutex<SplitSink<&'a mut S, Message>>;

/// Runs until the client goes away, the process exits, or `cancel` fires.
/// The sandbox heartbeat is refreshed one last time on the way out.
///
/// Normal endings (client close, cancellation, end of stream, a killed
/// process) return `Ok`; anything else is an [`ShellError::Exec`].
pub async fn run_bridge<S, E>(
    socket: &mut S,
    exec: ExecChannel,
    keepalive: &dyn Keepalive,
    options: &BridgeOptions,
    cancel: &CancellationToken,
) -> ShellResult<()>
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin + Send,
    E: Display + Send,
{
    let cancel = cancel.child_token();
    let ExecChannel {
        stdin,
        resize,
        events,
    } = exec;

    let (sink, source) = socket.split();
    let writer = Mutex::new(sink);

    let (_, outcome, _) = tokio::join!(
        inbound(source, stdin, resize, options, &cancel),
        outbound(events, &writer, options, &cancel),
        liveness(&writer, keepalive, options, &cancel),
    );

    keepalive.refresh().await;
    outcome
}

fn looks_like_control_frame(text: &str) -> bool {
    text.starts_with('{') && text.len() < CONTROL_FRAME_LIMIT
}

fn parse_resize(text: &str) -> Option<TerminalSize> {
    if !text.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<ControlFrame>(text) {
        Ok(ControlFrame::Resize { cols, rows }) if cols > 0 && rows > 0 => {
            Some(TerminalSize { cols, rows })
        }
        _ => None,
    }
}

async fn inbound<S, E>(
    mut source: SplitStream<&mut S>,
    stdin: mpsc::Sender<Vec<u8>>,
    resize: mpsc::Sender<TerminalSize>,
    options: &BridgeOptions,
    cancel: &CancellationToken,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut skip_pending = options.skip_session_frame;
    let mut last_heard = Instant::now();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(options.read_poll, source.next()) => next,
        };

        let message = match next {
            Err(_) => {
                if last_heard.elapsed() > options.peer_silence {
                    info!("client silent too long, closing bridge");
                    break;
                }
                continue;
            }
            Ok(None) => {
                debug!("client stream ended");
                break;
            }
            Ok(Some(Err(err))) => {
                debug!(error = %err, "client read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        last_heard = Instant::now();

        let input = match message {
            Message::Close(frame) => {
                info!(?frame, "client closed connection");
                break;
            }
            Message::Text(text) => {
                let text = text.as_str();
                if let Some(size) = parse_resize(text) {
                    if resize.send(size).await.is_err() {
                        break;
                    }
                    continue;
                }
                if skip_pending && looks_like_control_frame(text) {
                    skip_pending = false;
                    debug!("dropped session-info echo");
                    continue;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(data) => data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if input.is_empty() {
            continue;
        }
        if stdin.send(input).await.is_err() {
            debug!("process input closed");
            break;
        }
    }

    cancel.cancel();
}

async fn outbound<S, E>(
    mut events: mpsc::Receiver<ExecEvent>,
    writer: &Writer<'_, S>,
    options: &BridgeOptions,
    cancel: &CancellationToken,
) -> ShellResult<()>
where
    S: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let outcome = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = events.recv() => event,
        };

        match event {
            Some(ExecEvent::Output(bytes)) => {
                let mut sink = writer.lock().await;
                match tokio::time::timeout(
                    options.write_timeout,
                    sink.send(Message::Binary(bytes.into())),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(error = %err, "client write failed");
                        break Ok(());
                    }
                    Err(_) => {
                        info!("client write timed out");
                        break Ok(());
                    }
                }
            }
            Some(ExecEvent::Exit(status)) => break translate_exit(status),
            None => break Ok(()),
        }
    };

    cancel.cancel();
    outcome
}

async fn liveness<S, E>(
    writer: &Writer<'_, S>,
    keepalive: &dyn Keepalive,
    options: &BridgeOptions,
    cancel: &CancellationToken,
) where
    S: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(options.ping_grace) => {}
    }

    let start = tokio::time::Instant::now();
    let mut pings = tokio::time::interval_at(start, options.ping_interval);
    let mut heartbeats =
        tokio::time::interval_at(start + options.heartbeat_interval, options.heartbeat_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pings.tick() => {
                let mut sink = writer.lock().await;
                let ping = tokio::time::timeout(
                    options.ping_timeout,
                    sink.send(Message::Ping(Default::default())),
                )
                .await;
                if !matches!(ping, Ok(Ok(()))) {
                    info!("keep-alive ping failed, closing bridge");
                    cancel.cancel();
                    break;
                }
            }
            _ = heartbeats.tick() => keepalive.refresh().await,
        }
    }
}

/// A killed process is how a disconnect usually ends, so it is not an error.
pub fn translate_exit(status: ExecStatus) -> ShellResult<()> {
    match status {
        ExecStatus::Success => Ok(()),
        ExecStatus::ExitCode(KILLED_EXIT_CODE) => {
            debug!("process killed, treating as end of stream");
            Ok(())
        }
        ExecStatus::ExitCode(code) => Err(ShellError::Exec(format!(
            "command terminated with exit code {code}"
        ))),
        ExecStatus::Failure(message) => {
            warn!(%message, "exec stream failed");
            Err(ShellError::Exec(message))
        }
    }
}
