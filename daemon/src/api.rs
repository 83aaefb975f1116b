/// Route handlers for the `§6.1` REST surface: axum extractors into
/// `AgentController`/`Store`/`AuthManager` calls, DTO conversion via
/// `types.rs`, errors propagated through `DaemonError`'s `IntoResponse`.
use crate::auth::AuthManager;
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::MetricsCollector;
use crate::types::*;
use agentd_core::{
    AgentController, AgentListQuery, AgentSortKey, AgentStatus, CreateAgentRequest, Principal,
    ProcessSupervisor, Role, Store, UpdateAgentRequest,
};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState {
    pub store: Arc<Store>,
    pub controller: Arc<AgentController>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub auth: Arc<AuthManager>,
    pub metrics: Arc<MetricsCollector>,
    pub version: String,
    pub started_at: std::time::Instant,
    /// Flipped once during the `§5` shutdown sequence; `start`/`restart`
    /// reject new intents after that point instead of racing the supervisor
    /// shutting every running agent down underneath them.
    pub shutting_down: std::sync::atomic::AtomicBool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/profile", get(profile))
        .route("/api/agents", post(create_agent).get(list_agents))
        .route("/api/agents/processes", get(list_processes))
        .route("/api/agents/stats", get(agent_stats))
        .route("/api/agents/validate-config", post(validate_config))
        .route(
            "/api/agents/:id",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/api/agents/:id/start", post(start_agent))
        .route("/api/agents/:id/stop", post(stop_agent))
        .route("/api/agents/:id/restart", post(restart_agent))
        .route("/api/agents/:id/process", get(agent_process))
        .route("/api/agents/:id/health", get(agent_health))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

/// Extracted from `Authorization: Bearer <jwt>` by any handler that takes
/// it as a parameter; missing/invalid tokens fail extraction before the
/// handler body runs.
pub struct AuthenticatedUser(pub Principal);

impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = DaemonError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(DaemonError::AuthRequired)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(DaemonError::AuthRequired)?;
        let claims = state.auth.verify_access_token(token)?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| DaemonError::InvalidCredentials)?;
        Ok(AuthenticatedUser(Principal {
            user_id,
            role: claims.role,
        }))
    }
}

fn require_operator(principal: &Principal) -> DaemonResult<()> {
    if principal.role.at_least(Role::Operator) {
        Ok(())
    } else {
        Err(DaemonError::Forbidden(
            "requires at least operator role".to_string(),
        ))
    }
}

// ---- auth ----

async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> DaemonResult<Response> {
    if state
        .store
        .get_user_by_username(&body.username)
        .await?
        .is_some()
    {
        return Err(DaemonError::Conflict(format!(
            "username '{}' already in use",
            body.username
        )));
    }
    let password_hash = state.auth.hash_password(&body.password)?;
    let user = agentd_core::User {
        id: Uuid::new_v4(),
        username: body.username,
        email: body.email,
        password_hash,
        role: Role::Viewer,
        is_active: true,
        created_at: chrono::Utc::now(),
    };
    state.store.create_user(&user).await?;
    Ok((
        StatusCode::CREATED,
        Json(ProfileResponse {
            user_id: user.id,
            username: user.username,
            email: user.email,
            role: user.role,
        }),
    )
        .into_response())
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> DaemonResult<Json<TokenPairResponse>> {
    let user = state
        .store
        .get_user_by_username(&body.username)
        .await?
        .ok_or(DaemonError::InvalidCredentials)?;
    if !user.is_active || !state.auth.verify_password(&body.password, &user.password_hash) {
        return Err(DaemonError::InvalidCredentials);
    }
    let (access_token, expires_at) = state.auth.generate_access_token(user.id, user.role)?;
    let (refresh_token, _) = state.auth.issue_refresh_token(&state.store, user.id).await?;
    Ok(Json(TokenPairResponse {
        access_token,
        refresh_token,
        expires_at,
    }))
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> DaemonResult<Json<TokenPairResponse>> {
    let (user_id, refresh_token, _) = state
        .auth
        .rotate_refresh_token(&state.store, &body.refresh_token)
        .await?;
    let user = state.store.get_user_by_id(user_id).await?;
    let (access_token, expires_at) = state.auth.generate_access_token(user.id, user.role)?;
    Ok(Json(TokenPairResponse {
        access_token,
        refresh_token,
        expires_at,
    }))
}

async fn profile(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> DaemonResult<Json<ProfileResponse>> {
    let user = state.store.get_user_by_id(principal.user_id).await?;
    Ok(Json(ProfileResponse {
        user_id: user.id,
        username: user.username,
        email: user.email,
        role: user.role,
    }))
}

// ---- agents ----

async fn create_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Json(body): Json<CreateAgentBody>,
) -> DaemonResult<(StatusCode, Json<AgentResponse>)> {
    let agent = state
        .controller
        .create_agent(
            &principal,
            CreateAgentRequest {
                name: body.name,
                description: body.description,
                template_id: body.template_id,
                config: body.config,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(agent.into())))
}

fn parse_sort_key(raw: &str) -> DaemonResult<AgentSortKey> {
    match raw {
        "createdAt" => Ok(AgentSortKey::CreatedAt),
        "name" => Ok(AgentSortKey::Name),
        "status" => Ok(AgentSortKey::Status),
        other => Err(DaemonError::Validation(format!(
            "unrecognized sort key: {other}"
        ))),
    }
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Query(params): Query<ListAgentsQuery>,
) -> DaemonResult<Json<AgentListResponse>> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(10).clamp(1, 100);
    let sort_by = match &params.sort {
        Some(s) => parse_sort_key(s)?,
        None => AgentSortKey::CreatedAt,
    };

    let query = AgentListQuery {
        owner_id: None,
        status: params.status,
        search: params.search,
        page,
        limit,
        sort_by,
        sort_desc: params.desc,
    };

    let (agents, total) = state
        .controller
        .list_agents_with_total(&principal, query)
        .await?;

    Ok(Json(AgentListResponse {
        agents: agents.into_iter().map(Into::into).collect(),
        page,
        limit,
        total,
    }))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> DaemonResult<Json<AgentResponse>> {
    let agent = state.controller.get_agent(&principal, id).await?;
    Ok(Json(agent.into()))
}

async fn update_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAgentBody>,
) -> DaemonResult<Json<AgentResponse>> {
    require_operator(&principal)?;
    let agent = state
        .controller
        .update_agent(
            &principal,
            id,
            UpdateAgentRequest {
                name: body.name,
                description: body.description,
                config: body.config,
            },
        )
        .await?;
    Ok(Json(agent.into()))
}

async fn delete_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> DaemonResult<StatusCode> {
    require_operator(&principal)?;
    state.controller.delete_agent(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn reject_if_shutting_down(state: &AppState) -> DaemonResult<()> {
    if state.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
        Err(DaemonError::ResourceExhausted(
            "daemon is shutting down, not accepting new start/restart intents".to_string(),
        ))
    } else {
        Ok(())
    }
}

async fn start_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> DaemonResult<Json<AgentResponse>> {
    require_operator(&principal)?;
    reject_if_shutting_down(&state)?;
    let agent = state.controller.start(&principal, id).await?;
    state.metrics.record_agent_started();
    Ok(Json(agent.into()))
}

async fn stop_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
    body: Option<Json<StopAgentBody>>,
) -> DaemonResult<Json<AgentResponse>> {
    require_operator(&principal)?;
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let agent = state.controller.stop(&principal, id, force).await?;
    state.metrics.record_agent_stopped();
    Ok(Json(agent.into()))
}

async fn restart_agent(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> DaemonResult<Json<AgentResponse>> {
    require_operator(&principal)?;
    reject_if_shutting_down(&state)?;
    let agent = state.controller.restart(&principal, id).await?;
    state.metrics.record_agent_restarted();
    Ok(Json(agent.into()))
}

async fn agent_process(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> DaemonResult<Json<ProcessSnapshotResponse>> {
    let agent = state.controller.get_agent(&principal, id).await?;
    let samples = state.store.list_metric_samples(id, 1).await?;
    Ok(Json(ProcessSnapshotResponse {
        agent_id: agent.id,
        process_id: agent.process_id,
        port: agent.port,
        last_heartbeat: agent.last_heartbeat,
        registered_with_supervisor: state.supervisor.is_registered(id),
        latest_metric: samples.into_iter().next().map(Into::into),
    }))
}

async fn agent_health(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> DaemonResult<Json<AgentHealthResponse>> {
    let agent = state.controller.get_agent(&principal, id).await?;
    let stale = agent.status == AgentStatus::Running
        && match agent.last_heartbeat {
            Some(last) => chrono::Utc::now() - last > chrono::Duration::seconds(60),
            None => true,
        };
    Ok(Json(AgentHealthResponse {
        agent_id: agent.id,
        status: agent.status,
        stale,
        error_message: agent.error_message,
    }))
}

async fn list_processes(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> DaemonResult<Json<Vec<ProcessSnapshotResponse>>> {
    require_operator(&principal)?;
    let agents = state
        .store
        .list_agents(&AgentListQuery {
            limit: u32::MAX,
            ..Default::default()
        })
        .await?;
    let mut snapshots = Vec::with_capacity(agents.len());
    for agent in agents {
        let samples = state.store.list_metric_samples(agent.id, 1).await?;
        snapshots.push(ProcessSnapshotResponse {
            agent_id: agent.id,
            process_id: agent.process_id,
            port: agent.port,
            last_heartbeat: agent.last_heartbeat,
            registered_with_supervisor: state.supervisor.is_registered(agent.id),
            latest_metric: samples.into_iter().next().map(Into::into),
        });
    }
    Ok(Json(snapshots))
}

async fn agent_stats(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> DaemonResult<Json<AgentStatsResponse>> {
    let owner = if principal.role.at_least(Role::Admin) {
        None
    } else {
        Some(principal.user_id)
    };
    let counts = state.store.count_by_status(owner).await?;
    Ok(Json(counts.into()))
}

async fn validate_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateConfigBody>,
) -> DaemonResult<Json<ValidateConfigResponse>> {
    let effective = match body.template_id {
        Some(template_id) => {
            let template = state.store.get_template(template_id).await?;
            template.config.merged_with_user(&body.config)
        }
        None => body.config,
    };
    match effective.validate() {
        Ok(()) => Ok(Json(ValidateConfigResponse {
            valid: true,
            error: None,
        })),
        Err(e) => Ok(Json(ValidateConfigResponse {
            valid: false,
            error: Some(e),
        })),
    }
}

// ---- ops ----

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now(),
    })
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> DaemonResult<String> {
    state.metrics.gather()
}
