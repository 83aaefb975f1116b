/// REST DTOs: request/response bodies for the `/api/*` surface.
use agentd_core::{Agent, AgentConfigDocument, AgentStatus, AgentStatusCounts, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: AgentStatus,
    pub config: AgentConfigDocument,
    pub template_id: Option<Uuid>,
    pub process_id: Option<u32>,
    pub port: Option<u16>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub restart_count: u32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Agent> for AgentResponse {
    fn from(a: Agent) -> Self {
        AgentResponse {
            id: a.id,
            name: a.name,
            description: a.description,
            status: a.status,
            config: a.config,
            template_id: a.template_id,
            process_id: a.process_id,
            port: a.port,
            last_heartbeat: a.last_heartbeat,
            error_message: a.error_message,
            restart_count: a.restart_count,
            created_by: a.created_by,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentResponse>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgentBody {
    pub name: String,
    pub description: Option<String>,
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub config: AgentConfigDocument,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAgentBody {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    pub config: Option<AgentConfigDocument>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StopAgentBody {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListAgentsQuery {
    pub status: Option<AgentStatus>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort: Option<String>,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatsResponse {
    pub stopped: u64,
    pub starting: u64,
    pub running: u64,
    pub stopping: u64,
    pub error: u64,
}

impl From<AgentStatusCounts> for AgentStatsResponse {
    fn from(c: AgentStatusCounts) -> Self {
        AgentStatsResponse {
            stopped: c.stopped,
            starting: c.starting,
            running: c.running,
            stopping: c.stopping,
            error: c.error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshotResponse {
    pub agent_id: Uuid,
    pub process_id: Option<u32>,
    pub port: Option<u16>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_with_supervisor: bool,
    pub latest_metric: Option<MetricSampleResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSampleResponse {
    pub rss_bytes: i64,
    pub heap_total_bytes: i64,
    pub heap_used_bytes: i64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub recorded_at: DateTime<Utc>,
}

impl From<agentd_core::MetricSample> for MetricSampleResponse {
    fn from(m: agentd_core::MetricSample) -> Self {
        MetricSampleResponse {
            rss_bytes: m.rss_bytes,
            heap_total_bytes: m.heap_total_bytes,
            heap_used_bytes: m.heap_used_bytes,
            cpu_user: m.cpu_user,
            cpu_system: m.cpu_system,
            recorded_at: m.recorded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentHealthResponse {
    pub agent_id: Uuid,
    pub status: AgentStatus,
    pub stale: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateConfigBody {
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub config: AgentConfigDocument,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateConfigResponse {
    pub valid: bool,
    pub error: Option<String>,
}

// ---- auth ----

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileResponse {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}
