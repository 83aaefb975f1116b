/// Drains `SupervisorEvent`s and turns them into `Store`/`AgentController`
/// writes: debounced heartbeat persistence, metric/log append, and the
/// unexpected-exit recovery policy (restart within `MAX_RESTARTS`, otherwise
/// settle in `error`).
///
/// Per the design notes this is the one place restart policy lives — the
/// supervisor's own exit-watch task only reports that a child exited, it
/// never decides what happens next.
use crate::config::AgentdCoreConfig;
use crate::controller::AgentController;
use crate::models::AgentStatus;
use crate::store::{AgentFieldUpdate, LogRecord, LogStream, MetricSample, Store};
use crate::supervisor::{LogStreamKind, ProcessSupervisor, SupervisorEvent};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct SupervisorEventLoop {
    store: Arc<Store>,
    controller: Arc<AgentController>,
    supervisor: Arc<ProcessSupervisor>,
    config: AgentdCoreConfig,
    last_persisted_heartbeat: DashMap<Uuid, Instant>,
}

impl SupervisorEventLoop {
    pub fn new(
        store: Arc<Store>,
        controller: Arc<AgentController>,
        supervisor: Arc<ProcessSupervisor>,
        config: AgentdCoreConfig,
    ) -> Self {
        SupervisorEventLoop {
            store,
            controller,
            supervisor,
            config,
            last_persisted_heartbeat: DashMap::new(),
        }
    }

    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
        while let Some(event) = events_rx.recv().await {
            self.handle(event).await;
        }
    }

    async fn handle(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Heartbeat { agent_id } => self.handle_heartbeat(agent_id).await,
            SupervisorEvent::Metrics { agent_id, sample } => {
                let record = MetricSample {
                    id: Uuid::new_v4(),
                    agent_id,
                    rss_bytes: sample.rss_bytes,
                    heap_total_bytes: sample.heap_total_bytes,
                    heap_used_bytes: sample.heap_used_bytes,
                    cpu_user: sample.cpu_user,
                    cpu_system: sample.cpu_system,
                    recorded_at: Utc::now(),
                };
                if let Err(e) = self.store.append_metric_sample(&record).await {
                    tracing::warn!(%agent_id, error = %e, "failed to persist metric sample");
                }
            }
            SupervisorEvent::Log {
                agent_id,
                stream,
                line,
            } => {
                if stream == LogStreamKind::Stderr {
                    tracing::error!(%agent_id, %line, "worker stderr");
                }
                let record = LogRecord {
                    id: Uuid::new_v4(),
                    agent_id,
                    stream: match stream {
                        LogStreamKind::Stdout => LogStream::Stdout,
                        LogStreamKind::Stderr => LogStream::Stderr,
                    },
                    line,
                    recorded_at: Utc::now(),
                };
                if let Err(e) = self.store.append_log(&record).await {
                    tracing::warn!(%agent_id, error = %e, "failed to persist log line");
                }
            }
            SupervisorEvent::Exited {
                agent_id,
                exit_code,
            } => self.handle_exit(agent_id, exit_code).await,
        }
    }

    async fn handle_heartbeat(&self, agent_id: Uuid) {
        let debounce = self.config.heartbeat_interval() / 2;
        let due = match self.last_persisted_heartbeat.get(&agent_id) {
            Some(last) => last.elapsed() >= debounce,
            None => true,
        };
        if !due {
            return;
        }
        self.last_persisted_heartbeat.insert(agent_id, Instant::now());
        if let Err(e) = self.controller.record_heartbeat(agent_id).await {
            tracing::warn!(%agent_id, error = %e, "failed to persist heartbeat");
        }
    }

    /// `stop()`-driven exits are already fully handled by
    /// `AgentController::stop`; this only reacts to exits nobody asked for.
    async fn handle_exit(&self, agent_id: Uuid, exit_code: Option<i32>) {
        self.last_persisted_heartbeat.remove(&agent_id);
        let agent = match self.store.get_agent(agent_id).await {
            Ok(a) => a,
            Err(_) => {
                self.supervisor.forget(agent_id);
                return;
            }
        };
        if agent.status != AgentStatus::Running {
            return;
        }
        self.supervisor.forget(agent_id);

        if exit_code == Some(0) {
            let result = self
                .store
                .update_agent_fields(
                    agent_id,
                    Some(AgentStatus::Running),
                    AgentFieldUpdate {
                        status: Some(AgentStatus::Stopped),
                        process_id: Some(None),
                        port: Some(None),
                        last_heartbeat: Some(None),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(%agent_id, error = %e, "failed to record clean worker exit");
            }
            return;
        }

        let message = format!(
            "process exited with code {}",
            exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        if let Err(e) = self.controller.mark_error(agent_id, message).await {
            tracing::warn!(%agent_id, error = %e, "failed to mark crashed agent as error");
            return;
        }

        if agent.restart_count >= self.config.max_restarts {
            tracing::warn!(%agent_id, "max restarts reached, leaving agent in error");
            return;
        }

        let controller = self.controller.clone();
        let backoff = self.config.restart_backoff();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Err(e) = controller.auto_restart(agent_id).await {
                tracing::warn!(%agent_id, error = %e, "auto-restart failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Agent, AgentConfigDocument};
    use crate::store::Store;

    fn sample_agent(owner: Uuid) -> Agent {
        let now = Utc::now();
        Agent {
            id: Uuid::new_v4(),
            name: "crasher".into(),
            description: None,
            status: AgentStatus::Running,
            config: AgentConfigDocument {
                model: Some("m".into()),
                ..Default::default()
            },
            template_id: None,
            process_id: Some(42),
            port: Some(3001),
            last_heartbeat: Some(now),
            error_message: None,
            restart_count: 0,
            created_by: owner,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn clean_exit_clears_process_fields() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let (supervisor, events_rx) = ProcessSupervisor::new("agentd-worker".into());
        let supervisor = Arc::new(supervisor);
        let config = AgentdCoreConfig::default();
        let controller = Arc::new(AgentController::new(
            store.clone(),
            supervisor.clone(),
            config.clone(),
        ));
        let agent = sample_agent(Uuid::new_v4());
        store.create_agent(&agent).await.unwrap();

        let event_loop = Arc::new(SupervisorEventLoop::new(
            store.clone(),
            controller,
            supervisor,
            config,
        ));
        drop(events_rx);
        event_loop.handle_exit(agent.id, Some(0)).await;

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.status, AgentStatus::Stopped);
        assert!(fetched.process_id.is_none());
    }

    #[tokio::test]
    async fn crash_marks_error_and_schedules_restart_within_policy() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let (supervisor, events_rx) = ProcessSupervisor::new("agentd-worker".into());
        let supervisor = Arc::new(supervisor);
        let config = AgentdCoreConfig::default();
        let controller = Arc::new(AgentController::new(
            store.clone(),
            supervisor.clone(),
            config.clone(),
        ));
        let agent = sample_agent(Uuid::new_v4());
        store.create_agent(&agent).await.unwrap();

        let event_loop = Arc::new(SupervisorEventLoop::new(store.clone(), controller, supervisor, config));
        drop(events_rx);
        event_loop.handle_exit(agent.id, Some(1)).await;

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.status, AgentStatus::Error);
        assert!(fetched.error_message.is_some());
    }
}
