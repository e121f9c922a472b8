//! In-process cluster used to exercise the lifecycle manager and the bridge
//! without a Kubernetes API server.
//!
//! Pods advance through their phases as they are read, which is enough to
//! drive the polling loops: a fresh pod turns Running+Ready after a
//! configurable number of reads, and a deleted pod can linger in the
//! terminating state for a few reads before it disappears.

use super::{
    ClusterApi, ClusterError, ClusterResult, ExecChannel, ExecEvent, ExecRequest,
};
use crate::models::{
    ownership_labels, Sandbox, SandboxPhase, SandboxSpec, TerminalSize, VolumeSpec,
    HEARTBEAT_ANNOTATION, LABEL_OWNER, LABEL_SESSION,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;

#[derive(Clone, Debug, Default)]
pub struct Behavior {
    /// Reads of a new pod before it reports Running+Ready.
    pub ready_after_reads: usize,
    /// New pods stay Pending forever.
    pub never_ready: bool,
    /// New pods move to this phase instead of becoming ready.
    pub fail_with_phase: Option<SandboxPhase>,
    /// Reads a deleted pod stays visible (terminating) before it is gone.
    pub delete_lingers_for: usize,
    pub fail_volume_create: bool,
    /// Every exec attempt fails with this message.
    pub exec_error: Option<String>,
    /// The next this many pod reads fail with a transport error.
    pub failing_reads: usize,
}

struct MemoryPod {
    sandbox: Sandbox,
    reads_until_ready: usize,
    reads_until_gone: Option<usize>,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<String, MemoryPod>,
    volumes: BTreeSet<String>,
    created: Vec<String>,
    deleted: Vec<String>,
    heartbeats: usize,
}

/// Far end of an exec channel, handed to tests so they can play the process.
pub struct ExecProcess {
    pub request: ExecRequest,
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub resize: mpsc::Receiver<TerminalSize>,
    pub events: mpsc::Sender<ExecEvent>,
}

pub struct MemoryCluster {
    state: Mutex<State>,
    behavior: Mutex<Behavior>,
    exec_tx: mpsc::UnboundedSender<ExecProcess>,
    exec_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ExecProcess>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::default())
    }

    pub fn with_behavior(behavior: Behavior) -> Self {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            behavior: Mutex::new(behavior),
            exec_tx,
            exec_rx: tokio::sync::Mutex::new(exec_rx),
        }
    }

    pub fn update_behavior(&self, update: impl FnOnce(&mut Behavior)) {
        update(&mut self.behavior.lock());
    }

    /// Seeds a sandbox as if some earlier process had created it.
    pub fn insert_sandbox(&self, sandbox: Sandbox) {
        self.state.lock().pods.insert(
            sandbox.name.clone(),
            MemoryPod {
                sandbox,
                reads_until_ready: 0,
                reads_until_gone: None,
            },
        );
    }

    /// Current state without advancing any phase transitions.
    pub fn sandbox(&self, name: &str) -> Option<Sandbox> {
        self.state.lock().pods.get(name).map(|p| p.sandbox.clone())
    }

    pub fn sandbox_names(&self) -> Vec<String> {
        self.state.lock().pods.keys().cloned().collect()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains(name)
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.state.lock().heartbeats
    }

    /// Waits for the next exec opened against this cluster.
    pub async fn next_exec(&self) -> Option<ExecProcess> {
        self.exec_rx.lock().await.recv().await
    }

    fn advance(pod: &mut MemoryPod, behavior: &Behavior) -> bool {
        if let Some(remaining) = pod.reads_until_gone.as_mut() {
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
            return true;
        }

        // only freshly created pods progress on their own
        if pod.sandbox.ready || behavior.never_ready || pod.sandbox.phase != SandboxPhase::Pending {
            return true;
        }

        if pod.reads_until_ready > 0 {
            pod.reads_until_ready -= 1;
            return true;
        }

        match behavior.fail_with_phase {
            Some(phase) => pod.sandbox.phase = phase,
            None => {
                pod.sandbox.phase = SandboxPhase::Running;
                pod.sandbox.ready = true;
            }
        }
        true
    }
}

fn matches_selector(sandbox: &Sandbox, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| sandbox.labels.get(k).is_some_and(|actual| actual == v))
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_sandbox(&self, name: &str) -> ClusterResult<Option<Sandbox>> {
        let behavior = {
            let mut behavior = self.behavior.lock();
            if behavior.failing_reads > 0 {
                behavior.failing_reads -= 1;
                return Err(ClusterError::Transport("connection reset".to_string()));
            }
            behavior.clone()
        };
        let mut state = self.state.lock();
        let Some(pod) = state.pods.get_mut(name) else {
            return Ok(None);
        };

        if Self::advance(pod, &behavior) {
            Ok(Some(pod.sandbox.clone()))
        } else {
            state.pods.remove(name);
            Ok(None)
        }
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ClusterResult<Sandbox> {
        let behavior = self.behavior.lock().clone();
        let mut state = self.state.lock();
        if state.pods.contains_key(&spec.name) {
            return Err(ClusterError::Conflict {
                kind: "pod",
                name: spec.name.clone(),
            });
        }

        let mut labels = ownership_labels();
        labels.insert(LABEL_OWNER.to_string(), spec.owner.clone());
        labels.insert(LABEL_SESSION.to_string(), spec.session_id.clone());

        let mut annotations = BTreeMap::new();
        annotations.insert(
            HEARTBEAT_ANNOTATION.to_string(),
            spec.heartbeat.to_rfc3339(),
        );

        let sandbox = Sandbox {
            name: spec.name.clone(),
            owner: spec.owner.clone(),
            phase: SandboxPhase::Pending,
            ready: false,
            terminating: false,
            created_at: Utc::now(),
            home_volume: Some(spec.home_volume.clone()),
            labels,
            annotations,
        };

        state.pods.insert(
            spec.name.clone(),
            MemoryPod {
                sandbox: sandbox.clone(),
                reads_until_ready: behavior.ready_after_reads,
                reads_until_gone: None,
            },
        );
        state.created.push(spec.name.clone());
        Ok(sandbox)
    }

    async fn delete_sandbox(&self, name: &str) -> ClusterResult<()> {
        let lingers = self.behavior.lock().delete_lingers_for;
        let mut state = self.state.lock();
        let Some(pod) = state.pods.get_mut(name) else {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: name.to_string(),
            });
        };

        if pod.sandbox.terminating {
            return Ok(());
        }

        if lingers > 0 {
            pod.sandbox.terminating = true;
            pod.reads_until_gone = Some(lingers);
        } else {
            state.pods.remove(name);
        }
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn list_sandboxes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<Sandbox>> {
        Ok(self
            .state
            .lock()
            .pods
            .values()
            .filter(|p| matches_selector(&p.sandbox, selector))
            .map(|p| p.sandbox.clone())
            .collect())
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock();
        let Some(pod) = state.pods.get_mut(name) else {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: name.to_string(),
            });
        };
        pod.sandbox
            .annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.heartbeats += 1;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> ClusterResult<bool> {
        Ok(self.state.lock().volumes.contains(name))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> ClusterResult<()> {
        if self.behavior.lock().fail_volume_create {
            return Err(ClusterError::Api {
                status: 403,
                message: "persistentvolumeclaims is forbidden".to_string(),
            });
        }
        let mut state = self.state.lock();
        if !state.volumes.insert(spec.name.clone()) {
            return Err(ClusterError::Conflict {
                kind: "persistentvolumeclaim",
                name: spec.name.clone(),
            });
        }
        Ok(())
    }

    async fn exec(&self, request: ExecRequest) -> ClusterResult<ExecChannel> {
        if let Some(message) = self.behavior.lock().exec_error.clone() {
            return Err(ClusterError::Api {
                status: 500,
                message,
            });
        }
        if !self.state.lock().pods.contains_key(&request.sandbox) {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: request.sandbox.clone(),
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::channel(32);
        let (resize_tx, resize_rx) = mpsc::channel(4);
        let (events_tx, events_rx) = mpsc::channel(32);

        let process = ExecProcess {
            request,
            stdin: stdin_rx,
            resize: resize_rx,
            events: events_tx,
        };
        self.exec_tx
            .send(process)
            .map_err(|_| ClusterError::Transport("exec queue closed".to_string()))?;

        Ok(ExecChannel {
            stdin: stdin_tx,
            resize: resize_tx,
            events: events_rx,
        })
    }
}
