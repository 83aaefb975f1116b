/// Spawns, observes and terminates the worker child process backing each
/// agent.
///
/// Grounded on `agent_runner.rs`'s `LocalProcessRunner`/`LocalAgentHandle`:
/// one task reads the child's stdout line by line and turns each line into a
/// `stream_parser::WorkerRecord`, one task reads stderr and forwards it as
/// log lines, and a third waits on the child and reports its exit. Stopping
/// a process is the same two-phase `GracefulShutdown` shape: SIGTERM, wait
/// up to the grace timeout, then SIGKILL.
use crate::errors::{SupervisorError, SupervisorResult};
use crate::models::AgentConfigDocument;
use crate::stream_parser::{self, WorkerRecord};
use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Heartbeat { agent_id: Uuid },
    Metrics { agent_id: Uuid, sample: stream_parser::MetricsRecord },
    Log { agent_id: Uuid, stream: LogStreamKind, line: String },
    Exited { agent_id: Uuid, exit_code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

struct ProcessHandle {
    pid: u32,
    exited_rx: watch::Receiver<bool>,
}

/// Everything the supervisor needs to launch a worker for one agent.
pub struct SpawnSpec {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub port: u16,
    pub config: AgentConfigDocument,
}

pub struct ProcessSupervisor {
    worker_binary: std::path::PathBuf,
    handles: DashMap<Uuid, ProcessHandle>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        worker_binary: std::path::PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            ProcessSupervisor {
                worker_binary,
                handles: DashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn is_registered(&self, agent_id: Uuid) -> bool {
        self.handles.contains_key(&agent_id)
    }

    /// Spawns the worker and blocks until it emits a `ready` record or
    /// `ready_timeout` elapses. On timeout the child is killed and removed.
    pub async fn spawn(
        &self,
        spec: SpawnSpec,
        ready_timeout: Duration,
    ) -> SupervisorResult<u32> {
        let config_json = serde_json::to_string(&spec.config)
            .unwrap_or_else(|_| "{}".to_string());

        let mut command = Command::new(&self.worker_binary);
        command
            .env("AGENT_ID", spec.agent_id.to_string())
            .env("AGENT_PORT", spec.port.to_string())
            .env("AGENT_NAME", &spec.agent_name)
            .env("AGENT_CONFIG", config_json)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::SignalFailed("child exited before pid was available".to_string())
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (ready_tx, ready_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let agent_id = spec.agent_id;
        let events_tx = self.events_tx.clone();
        tokio::spawn(read_stdout(agent_id, stdout, events_tx, Some(ready_tx)));

        let events_tx = self.events_tx.clone();
        tokio::spawn(read_stderr(agent_id, stderr, events_tx));

        let events_tx = self.events_tx.clone();
        tokio::spawn(wait_for_exit(agent_id, child, events_tx, exited_tx));

        self.handles.insert(agent_id, ProcessHandle { pid, exited_rx });

        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(pid),
            _ => {
                // ready_tx dropped (process exited early) or timed out.
                self.force_kill(agent_id).ok();
                self.handles.remove(&agent_id);
                Err(SupervisorError::StartupTimeout)
            }
        }
    }

    /// SIGTERM, then wait up to `grace_timeout` for the exit task to observe
    /// the process leave, escalating to SIGKILL if it doesn't.
    pub async fn stop(&self, agent_id: Uuid, grace_timeout: Duration) -> SupervisorResult<()> {
        let mut exited_rx = {
            let handle = self
                .handles
                .get(&agent_id)
                .ok_or(SupervisorError::NotRegistered(agent_id))?;
            self.send_signal(handle.pid, Signal::SIGTERM)?;
            handle.exited_rx.clone()
        };

        let exited = tokio::time::timeout(grace_timeout, async {
            loop {
                if *exited_rx.borrow() {
                    return;
                }
                if exited_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            self.force_kill(agent_id)?;
        }

        self.handles.remove(&agent_id);
        Ok(())
    }

    fn force_kill(&self, agent_id: Uuid) -> SupervisorResult<()> {
        if let Some(handle) = self.handles.get(&agent_id) {
            self.send_signal(handle.pid, Signal::SIGKILL)?;
        }
        Ok(())
    }

    fn send_signal(&self, pid: u32, sig: Signal) -> SupervisorResult<()> {
        signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| SupervisorError::SignalFailed(e.to_string()))
    }

    pub fn pid_of(&self, agent_id: Uuid) -> Option<u32> {
        self.handles.get(&agent_id).map(|h| h.pid)
    }

    /// Drops a handle without signaling the process, for reaping a registry
    /// entry left behind by a crash `stop()` never ran for.
    pub fn forget(&self, agent_id: Uuid) {
        self.handles.remove(&agent_id);
    }

    /// Snapshot of currently-registered agent ids, used by the health
    /// monitor to cross-check the supervisor's view against the store's.
    pub fn registered_agents(&self) -> Vec<Uuid> {
        self.handles.iter().map(|e| *e.key()).collect()
    }
}

async fn read_stdout(
    agent_id: Uuid,
    stdout: tokio::process::ChildStdout,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    mut ready_tx: Option<oneshot::Sender<()>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream_parser::parse_line(&line) {
                Some(WorkerRecord::Ready) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
                Some(WorkerRecord::Heartbeat) => {
                    let _ = events_tx.send(SupervisorEvent::Heartbeat { agent_id });
                }
                Some(WorkerRecord::Metrics(sample)) => {
                    let _ = events_tx.send(SupervisorEvent::Metrics { agent_id, sample });
                }
                None => {
                    tracing::warn!(%agent_id, %line, "unparseable worker stdout line");
                    let _ = events_tx.send(SupervisorEvent::Log {
                        agent_id,
                        stream: LogStreamKind::Stdout,
                        line,
                    });
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%agent_id, error = %e, "error reading worker stdout");
                break;
            }
        }
    }
}

async fn read_stderr(
    agent_id: Uuid,
    stderr: tokio::process::ChildStderr,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = events_tx.send(SupervisorEvent::Log {
            agent_id,
            stream: LogStreamKind::Stderr,
            line,
        });
    }
}

async fn wait_for_exit(
    agent_id: Uuid,
    mut child: tokio::process::Child,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    exited_tx: watch::Sender<bool>,
) {
    let status = child.wait().await;
    let exit_code = status.ok().and_then(|s| s.code());
    let _ = exited_tx.send(true);
    let _ = events_tx.send(SupervisorEvent::Exited { agent_id, exit_code });
}

/// Tracks the last-known status of every worker env var name, purely as
/// documentation of the spawn contract; `spawn()` sets these directly.
pub fn worker_env_keys() -> HashMap<&'static str, &'static str> {
    let mut m = HashMap::new();
    m.insert("AGENT_ID", "uuid of the agent");
    m.insert("AGENT_PORT", "TCP port the worker's HTTP server must bind");
    m.insert("AGENT_NAME", "human-readable agent name");
    m.insert("AGENT_CONFIG", "JSON-encoded effective AgentConfigDocument");
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_env_keys_names_the_four_contract_vars() {
        let keys = worker_env_keys();
        assert_eq!(keys.len(), 4);
        assert!(keys.contains_key("AGENT_CONFIG"));
    }

    #[tokio::test]
    async fn spawning_a_missing_binary_errors() {
        let (supervisor, _events) =
            ProcessSupervisor::new(std::path::PathBuf::from("/nonexistent/agentd-worker"));
        let spec = SpawnSpec {
            agent_id: Uuid::new_v4(),
            agent_name: "a".into(),
            port: 3001,
            config: AgentConfigDocument::default(),
        };
        let result = supervisor.spawn(spec, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawning_true_then_waiting_for_ready_times_out() {
        // `/bin/true` exits immediately without ever printing a ready line,
        // so the ready wait must time out rather than hang.
        let (supervisor, _events) = ProcessSupervisor::new(std::path::PathBuf::from("/bin/true"));
        let spec = SpawnSpec {
            agent_id: Uuid::new_v4(),
            agent_name: "a".into(),
            port: 3001,
            config: AgentConfigDocument::default(),
        };
        let result = supervisor.spawn(spec, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(SupervisorError::StartupTimeout)));
    }
}
