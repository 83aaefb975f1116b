/// The sole writer of agent state: validates requests, checks ownership,
/// drives the 5-state lifecycle, and is the only caller that is allowed to
/// invoke `ProcessSupervisor::spawn`/`stop` or write `Store::update_agent_fields`
/// for a status change.
///
/// The transition-validity check follows the shape of `state_machine.rs`'s
/// `can_transition_to` — a flat match over `(from, to)` pairs — but the
/// states themselves are this system's own `stopped/starting/running/
/// stopping/error`, not the teacher's workflow states.
use crate::config::AgentdCoreConfig;
use crate::errors::{ControllerError, ControllerResult};
use crate::models::{Agent, AgentConfigDocument, AgentStatus, AgentTemplate, Role};
use crate::port_allocator::PortAllocator;
use crate::store::{AgentFieldUpdate, AgentListQuery, Store};
use crate::supervisor::{ProcessSupervisor, SpawnSpec};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// The authenticated caller driving a controller operation.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
}

impl Principal {
    fn owns(&self, agent: &Agent) -> bool {
        self.role.at_least(Role::Admin) || agent.created_by == self.user_id
    }

    fn require_owner_or_admin(&self, agent: &Agent) -> ControllerResult<()> {
        if self.owns(agent) {
            Ok(())
        } else {
            Err(ControllerError::Forbidden(
                "caller does not own this agent".to_string(),
            ))
        }
    }

    fn require_role(&self, required: Role) -> ControllerResult<()> {
        if self.role.at_least(required) {
            Ok(())
        } else {
            Err(ControllerError::Forbidden(format!(
                "requires at least {} role",
                required.as_str()
            )))
        }
    }
}

pub struct CreateAgentRequest {
    pub name: String,
    pub description: Option<String>,
    pub template_id: Option<Uuid>,
    pub config: AgentConfigDocument,
}

pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub config: Option<AgentConfigDocument>,
}

/// Returns `(from, to)` is a legal explicit-operation transition.
fn can_transition(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Error, Starting)
            | (Starting, Running)
            | (Starting, Error)
            | (Running, Stopping)
            | (Starting, Stopping)
            | (Stopping, Stopped)
            | (Stopping, Error)
            | (Running, Error)
    )
}

pub struct AgentController {
    store: Arc<Store>,
    supervisor: Arc<ProcessSupervisor>,
    config: AgentdCoreConfig,
}

impl AgentController {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<ProcessSupervisor>,
        config: AgentdCoreConfig,
    ) -> Self {
        AgentController {
            store,
            supervisor,
            config,
        }
    }

    pub async fn create_agent(
        &self,
        principal: &Principal,
        req: CreateAgentRequest,
    ) -> ControllerResult<Agent> {
        principal.require_role(Role::Operator)?;

        if !crate::models::is_valid_agent_name(&req.name) {
            return Err(ControllerError::Validation(format!(
                "invalid agent name: {}",
                req.name
            )));
        }

        let effective_config = match req.template_id {
            Some(template_id) => {
                let template = self.store.get_template(template_id).await?;
                template.config.merged_with_user(&req.config)
            }
            None => req.config,
        };
        effective_config
            .validate()
            .map_err(ControllerError::Validation)?;

        let now = Utc::now();
        let agent = Agent {
            id: Uuid::new_v4(),
            name: req.name,
            description: req.description,
            status: AgentStatus::Stopped,
            config: effective_config,
            template_id: req.template_id,
            process_id: None,
            port: None,
            last_heartbeat: None,
            error_message: None,
            restart_count: 0,
            created_by: principal.user_id,
            created_at: now,
            updated_at: now,
        };

        self.store.create_agent(&agent).await?;
        Ok(agent)
    }

    pub async fn get_agent(&self, principal: &Principal, id: Uuid) -> ControllerResult<Agent> {
        let agent = self.store.get_agent(id).await?;
        principal.require_owner_or_admin(&agent)?;
        Ok(agent)
    }

    pub async fn list_agents(
        &self,
        principal: &Principal,
        mut query: AgentListQuery,
    ) -> ControllerResult<Vec<Agent>> {
        if !principal.role.at_least(Role::Admin) {
            query.owner_id = Some(principal.user_id);
        }
        Ok(self.store.list_agents(&query).await?)
    }

    /// Same ownership-filtering rule as `list_agents`, plus the unpaginated
    /// match count so callers can render `{page, limit, total}`.
    pub async fn list_agents_with_total(
        &self,
        principal: &Principal,
        mut query: AgentListQuery,
    ) -> ControllerResult<(Vec<Agent>, u64)> {
        if !principal.role.at_least(Role::Admin) {
            query.owner_id = Some(principal.user_id);
        }
        let agents = self.store.list_agents(&query).await?;
        let total = self.store.count_agents(&query).await?;
        Ok((agents, total))
    }

    pub async fn update_agent(
        &self,
        principal: &Principal,
        id: Uuid,
        req: UpdateAgentRequest,
    ) -> ControllerResult<Agent> {
        let agent = self.store.get_agent(id).await?;
        principal.require_owner_or_admin(&agent)?;
        if agent.status != AgentStatus::Stopped {
            return Err(ControllerError::ConflictingState {
                current: agent.status.as_str().to_string(),
                required: "stopped".to_string(),
            });
        }

        if let Some(name) = &req.name {
            if !crate::models::is_valid_agent_name(name) {
                return Err(ControllerError::Validation(format!(
                    "invalid agent name: {name}"
                )));
            }
        }

        let config = match &req.config {
            Some(c) => {
                c.validate().map_err(ControllerError::Validation)?;
                Some(c.clone())
            }
            None => None,
        };

        self.store
            .update_agent_fields(
                id,
                Some(AgentStatus::Stopped),
                AgentFieldUpdate {
                    name: req.name,
                    description: req.description,
                    config,
                    ..Default::default()
                },
            )
            .await?;

        Ok(self.store.get_agent(id).await?)
    }

    pub async fn delete_agent(&self, principal: &Principal, id: Uuid) -> ControllerResult<()> {
        let agent = self.store.get_agent(id).await?;
        principal.require_owner_or_admin(&agent)?;
        if !matches!(agent.status, AgentStatus::Stopped | AgentStatus::Error) {
            return Err(ControllerError::ConflictingState {
                current: agent.status.as_str().to_string(),
                required: "stopped or error".to_string(),
            });
        }
        Ok(self.store.delete_agent(id).await?)
    }

    /// Allocates a port, flips the row to `starting`, spawns the worker, and
    /// flips it to `running` once the worker reports ready — or to `error`
    /// if the worker never becomes ready within the configured timeout.
    pub async fn start(&self, principal: &Principal, id: Uuid) -> ControllerResult<Agent> {
        let agent = self.store.get_agent(id).await?;
        principal.require_owner_or_admin(&agent)?;
        self.start_unchecked(agent).await
    }

    /// Bypasses ownership/role checks for the `HealthMonitor`/exit-recovery
    /// path, which acts on the supervisor's behalf rather than a user's.
    /// Increments `restart_count` once before spawning, distinct from a
    /// manual `start` (which never touches `restart_count`) and a manual
    /// `stop` (which resets it to 0).
    pub async fn auto_restart(&self, id: Uuid) -> ControllerResult<Agent> {
        let agent = self.store.get_agent(id).await?;
        if agent.status != AgentStatus::Error {
            return Err(ControllerError::ConflictingState {
                current: agent.status.as_str().to_string(),
                required: "error".to_string(),
            });
        }
        self.store
            .update_agent_fields(
                id,
                Some(AgentStatus::Error),
                AgentFieldUpdate {
                    restart_count: Some(agent.restart_count + 1),
                    ..Default::default()
                },
            )
            .await?;
        let agent = self.store.get_agent(id).await?;
        self.start_unchecked(agent).await
    }

    async fn start_unchecked(&self, agent: Agent) -> ControllerResult<Agent> {
        let id = agent.id;
        self.transition_or_conflict(agent.status, AgentStatus::Starting)?;

        let allocator =
            PortAllocator::new(self.store.as_ref(), self.config.port_min, self.config.port_max);
        let port = allocator.allocate().await?;

        self.store
            .update_agent_fields(
                id,
                Some(agent.status),
                AgentFieldUpdate {
                    status: Some(AgentStatus::Starting),
                    port: Some(Some(port)),
                    error_message: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        let spec = SpawnSpec {
            agent_id: id,
            agent_name: agent.name.clone(),
            port,
            config: agent.config.clone(),
        };

        match self.supervisor.spawn(spec, self.config.ready_timeout()).await {
            Ok(pid) => {
                self.store
                    .update_agent_fields(
                        id,
                        Some(AgentStatus::Starting),
                        AgentFieldUpdate {
                            status: Some(AgentStatus::Running),
                            process_id: Some(Some(pid)),
                            last_heartbeat: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Err(e) => {
                self.store
                    .update_agent_fields(
                        id,
                        Some(AgentStatus::Starting),
                        AgentFieldUpdate {
                            status: Some(AgentStatus::Error),
                            process_id: Some(None),
                            port: Some(None),
                            error_message: Some(Some(e.to_string())),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(ControllerError::from(e));
            }
        }

        Ok(self.store.get_agent(id).await?)
    }

    /// `force` escalates straight to SIGKILL-on-timeout semantics (grace
    /// timeout 0) instead of waiting the configured grace period.
    pub async fn stop(&self, principal: &Principal, id: Uuid, force: bool) -> ControllerResult<Agent> {
        let agent = self.store.get_agent(id).await?;
        principal.require_owner_or_admin(&agent)?;
        self.transition_or_conflict(agent.status, AgentStatus::Stopping)?;

        self.store
            .update_agent_fields(
                id,
                Some(agent.status),
                AgentFieldUpdate {
                    status: Some(AgentStatus::Stopping),
                    ..Default::default()
                },
            )
            .await?;

        let grace = if force {
            std::time::Duration::from_secs(0)
        } else {
            self.config.grace_timeout()
        };
        self.supervisor.stop(id, grace).await?;

        self.store
            .update_agent_fields(
                id,
                Some(AgentStatus::Stopping),
                AgentFieldUpdate {
                    status: Some(AgentStatus::Stopped),
                    process_id: Some(None),
                    port: Some(None),
                    last_heartbeat: Some(None),
                    restart_count: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        Ok(self.store.get_agent(id).await?)
    }

    /// Accepted from `running` (stop then start) or `error` (straight to
    /// start — `error -> starting` is already a legal transition, and the
    /// process is gone already so there is nothing to stop). Either path
    /// increments `restart_count` exactly once, after any stop step (which
    /// resets the count to 0 for a manual stop) and before the respawn.
    pub async fn restart(&self, principal: &Principal, id: Uuid) -> ControllerResult<Agent> {
        let agent = self.store.get_agent(id).await?;
        principal.require_owner_or_admin(&agent)?;
        if !matches!(agent.status, AgentStatus::Running | AgentStatus::Error) {
            return Err(ControllerError::ConflictingState {
                current: agent.status.as_str().to_string(),
                required: "running or error".to_string(),
            });
        }

        if agent.status == AgentStatus::Running {
            self.stop(principal, id, false).await?;
        }

        let agent = self.store.get_agent(id).await?;
        self.store
            .update_agent_fields(
                id,
                Some(agent.status),
                AgentFieldUpdate {
                    restart_count: Some(agent.restart_count + 1),
                    ..Default::default()
                },
            )
            .await?;

        let agent = self.store.get_agent(id).await?;
        self.start_unchecked(agent).await
    }

    /// Called by the health monitor (or the supervisor's exit-code handling)
    /// to force an agent into `error` outside of a user-initiated request.
    pub async fn mark_error(&self, id: Uuid, message: String) -> ControllerResult<()> {
        let agent = self.store.get_agent(id).await?;
        if agent.status == AgentStatus::Error {
            return Ok(());
        }
        self.store
            .update_agent_fields(
                id,
                Some(agent.status),
                AgentFieldUpdate {
                    status: Some(AgentStatus::Error),
                    process_id: Some(None),
                    port: Some(None),
                    error_message: Some(Some(message.clone())),
                    ..Default::default()
                },
            )
            .await?;
        self.store.append_alert(id, "error", &message).await?;
        Ok(())
    }

    pub async fn record_heartbeat(&self, id: Uuid) -> ControllerResult<()> {
        self.store
            .update_agent_fields(
                id,
                None,
                AgentFieldUpdate {
                    last_heartbeat: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn create_template(
        &self,
        principal: &Principal,
        name: String,
        description: Option<String>,
        config: AgentConfigDocument,
        version: String,
    ) -> ControllerResult<AgentTemplate> {
        principal.require_role(Role::Admin)?;
        config.validate().map_err(ControllerError::Validation)?;

        let now = Utc::now();
        let template = AgentTemplate {
            id: Uuid::new_v4(),
            name,
            description,
            config,
            version,
            is_active: true,
            created_by: principal.user_id,
            created_at: now,
            updated_at: now,
        };
        self.store.create_template(&template).await?;
        Ok(template)
    }

    fn transition_or_conflict(&self, from: AgentStatus, to: AgentStatus) -> ControllerResult<()> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(ControllerError::ConflictingState {
                current: from.as_str().to_string(),
                required: format!("a state that can transition to {}", to.as_str()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_can_start() {
        assert!(can_transition(AgentStatus::Stopped, AgentStatus::Starting));
    }

    #[test]
    fn running_cannot_go_directly_to_starting() {
        assert!(!can_transition(AgentStatus::Running, AgentStatus::Starting));
    }

    #[test]
    fn stopping_can_reach_stopped_or_error() {
        assert!(can_transition(AgentStatus::Stopping, AgentStatus::Stopped));
        assert!(can_transition(AgentStatus::Stopping, AgentStatus::Error));
    }

    #[test]
    fn terminal_error_requires_explicit_start_to_leave() {
        assert!(can_transition(AgentStatus::Error, AgentStatus::Starting));
        assert!(!can_transition(AgentStatus::Error, AgentStatus::Running));
    }

    fn sample_agent(owner: Uuid, status: AgentStatus, restart_count: u32) -> Agent {
        let now = chrono::Utc::now();
        Agent {
            id: Uuid::new_v4(),
            name: "restart-target".into(),
            description: None,
            status,
            config: AgentConfigDocument {
                model: Some("m".into()),
                ..Default::default()
            },
            template_id: None,
            process_id: if status == AgentStatus::Running {
                Some(123)
            } else {
                None
            },
            port: if status == AgentStatus::Running {
                Some(3001)
            } else {
                None
            },
            last_heartbeat: None,
            error_message: if status == AgentStatus::Error {
                Some("boom".to_string())
            } else {
                None
            },
            restart_count,
            created_by: owner,
            created_at: now,
            updated_at: now,
        }
    }

    /// A nonexistent worker binary makes `spawn()` fail immediately, so these
    /// tests exercise `restart`'s transition/count bookkeeping without
    /// needing a real worker process; the failure mode they check for is
    /// "is this a `ConflictingState`", not "did the agent end up running".
    fn unreachable_config() -> AgentdCoreConfig {
        let mut config = AgentdCoreConfig::default();
        config.worker_binary = "/nonexistent/agentd-worker-binary".into();
        config.ready_timeout_ms = 50;
        config
    }

    #[tokio::test]
    async fn restart_from_error_skips_stop_and_attempts_start_directly() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let (supervisor, _events) = ProcessSupervisor::new("irrelevant".into());
        let config = unreachable_config();
        let controller = AgentController::new(store.clone(), Arc::new(supervisor), config);

        let owner = Uuid::new_v4();
        let agent = sample_agent(owner, AgentStatus::Error, 1);
        store.create_agent(&agent).await.unwrap();

        let principal = Principal {
            user_id: owner,
            role: Role::Operator,
        };
        let err = controller
            .restart(&principal, agent.id)
            .await
            .expect_err("spawn against a nonexistent binary must fail");
        assert!(
            !matches!(err, ControllerError::ConflictingState { .. }),
            "restart from `error` must not go through `stop` (got {err:?})"
        );

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.restart_count, 2, "restart_count increments exactly once");
    }

    /// `echo` the ready line then `exec sleep` so the pid the supervisor
    /// captured stays the direct child throughout — no wrapper shell left
    /// between the supervisor and the process it signals on stop.
    fn ready_then_sleep_script() -> tempfile::NamedTempFile {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo '{{\"type\":\"ready\"}}'").unwrap();
        writeln!(file, "exec sleep 30").unwrap();
        file.flush().unwrap();
        let mut perms = file.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.as_file().set_permissions(perms).unwrap();
        file
    }

    #[tokio::test]
    async fn restart_from_running_increments_restart_count_exactly_once() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let script = ready_then_sleep_script();
        let (supervisor, _events) = ProcessSupervisor::new(script.path().to_path_buf());
        let mut config = AgentdCoreConfig::default();
        config.ready_timeout_ms = 2_000;
        config.grace_timeout_ms = 1_000;
        let controller = AgentController::new(store.clone(), Arc::new(supervisor), config);

        let owner = Uuid::new_v4();
        let principal = Principal {
            user_id: owner,
            role: Role::Operator,
        };
        let agent = controller
            .create_agent(
                &principal,
                CreateAgentRequest {
                    name: "restart-target".into(),
                    description: None,
                    template_id: None,
                    config: AgentConfigDocument {
                        model: Some("m".into()),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        controller.start(&principal, agent.id).await.unwrap();
        let running = store.get_agent(agent.id).await.unwrap();
        assert_eq!(running.status, AgentStatus::Running);
        assert_eq!(running.restart_count, 0);

        controller.restart(&principal, agent.id).await.unwrap();

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.status, AgentStatus::Running);
        assert_eq!(
            fetched.restart_count, 1,
            "restart_count increments exactly once, not zeroed by the intervening stop"
        );
    }
}
