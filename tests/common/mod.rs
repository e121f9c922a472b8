#![allow(dead_code)]

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::{Sink, Stream, StreamExt};
use kubeshell::bridge::BridgeOptions;
use kubeshell::cluster::memory::{Behavior, MemoryCluster};
use kubeshell::models::{
    ownership_labels, Sandbox, SandboxPhase, HEARTBEAT_ANNOTATION, LABEL_OWNER,
};
use kubeshell::sandbox::{LifecycleTimings, SandboxConfig, SandboxManager};
use kubeshell::service::{ServiceOptions, ShellService};
use kubeshell::session::SessionRegistry;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Server half of an in-process WebSocket.
pub struct TestSocket {
    incoming: mpsc::UnboundedReceiver<Result<Message, String>>,
    outgoing: mpsc::UnboundedSender<Message>,
}

/// Client half: what the browser would see and send.
pub struct TestClient {
    pub to_server: mpsc::UnboundedSender<Result<Message, String>>,
    pub from_server: mpsc::UnboundedReceiver<Message>,
}

pub fn socket_pair() -> (TestSocket, TestClient) {
    let (to_server, incoming) = mpsc::unbounded();
    let (outgoing, from_server) = mpsc::unbounded();
    (
        TestSocket { incoming, outgoing },
        TestClient {
            to_server,
            from_server,
        },
    )
}

impl Stream for TestSocket {
    type Item = Result<Message, String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_next_unpin(cx)
    }
}

impl Sink<Message> for TestSocket {
    type Error = String;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), String> {
        self.outgoing
            .unbounded_send(item)
            .map_err(|e| e.to_string())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        Poll::Ready(Ok(()))
    }
}

impl TestClient {
    pub fn send_text(&self, text: &str) {
        self.to_server
            .unbounded_send(Ok(Message::Text(text.into())))
            .unwrap();
    }

    pub fn close(&self) {
        self.to_server
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();
    }

    /// Next non-ping frame from the server, or `None` once it hangs up.
    pub async fn next_frame(&mut self) -> Option<Message> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.from_server.next())
                .await
                .expect("server went quiet")?;
            if !matches!(frame, Message::Ping(_)) {
                return Some(frame);
            }
        }
    }

    /// Text frames up to and including the first one containing `marker`.
    pub async fn text_until(&mut self, marker: &str) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(frame) = self.next_frame().await {
            if let Message::Text(text) = frame {
                let done = text.as_str().contains(marker);
                lines.push(text.to_string());
                if done {
                    return lines;
                }
            }
        }
        panic!("connection ended before {marker:?}; saw {lines:?}");
    }

    /// Close code and reason, skipping any frames before the close.
    pub async fn close_frame(&mut self) -> (u16, String) {
        while let Some(frame) = self.next_frame().await {
            if let Message::Close(Some(close)) = frame {
                return (close.code, close.reason.to_string());
            }
        }
        panic!("connection ended without a close frame");
    }
}

pub fn fast_timings() -> LifecycleTimings {
    LifecycleTimings {
        readiness_poll: Duration::from_millis(5),
        readiness_timeout: Duration::from_millis(200),
        termination_poll: Duration::from_millis(5),
        termination_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(2),
    }
}

pub fn fast_bridge() -> BridgeOptions {
    BridgeOptions {
        ping_grace: Duration::from_millis(10),
        ping_interval: Duration::from_millis(20),
        ping_timeout: Duration::from_millis(200),
        read_poll: Duration::from_millis(50),
        peer_silence: Duration::from_secs(30),
        write_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_millis(50),
        skip_session_frame: false,
    }
}

pub struct Harness {
    pub cluster: Arc<MemoryCluster>,
    pub sandboxes: Arc<SandboxManager>,
    pub registry: Arc<SessionRegistry>,
    pub service: Arc<ShellService>,
    pub shutdown: CancellationToken,
}

pub fn harness(behavior: Behavior) -> Harness {
    let cluster = Arc::new(MemoryCluster::with_behavior(behavior));
    let sandboxes = Arc::new(
        SandboxManager::new(cluster.clone(), SandboxConfig::default(), fast_timings()).unwrap(),
    );
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();
    let service = Arc::new(ShellService::new(
        registry.clone(),
        sandboxes.clone(),
        cluster.clone(),
        ServiceOptions {
            bridge: fast_bridge(),
            ..ServiceOptions::default()
        },
        shutdown.clone(),
    ));

    Harness {
        cluster,
        sandboxes,
        registry,
        service,
        shutdown,
    }
}

/// A sandbox as a previous server process would have left it.
pub fn existing_sandbox(
    owner: &str,
    phase: SandboxPhase,
    heartbeat: Option<DateTime<Utc>>,
) -> Sandbox {
    let mut labels = ownership_labels();
    labels.insert(LABEL_OWNER.to_string(), owner.to_string());

    let mut annotations = BTreeMap::new();
    if let Some(heartbeat) = heartbeat {
        annotations.insert(HEARTBEAT_ANNOTATION.to_string(), heartbeat.to_rfc3339());
    }

    Sandbox {
        name: format!("kubeshell-{owner}"),
        owner: owner.to_string(),
        phase,
        ready: phase == SandboxPhase::Running,
        terminating: false,
        created_at: Utc::now() - chrono::Duration::hours(1),
        home_volume: Some(format!("kubeshell-home-{owner}")),
        labels,
        annotations,
    }
}
