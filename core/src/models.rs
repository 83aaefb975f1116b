/// Data model: users, templates, agents, and the agent configuration document.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A registered user of the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        }
    }

    pub fn at_least(&self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Role::Viewer => 0,
            Role::Operator => 1,
            Role::Admin => 2,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A reusable template of default agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub config: AgentConfigDocument,
    pub version: String,
    pub is_active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The 5-state agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Stopped => "stopped",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Error => "error",
        }
    }

    /// I3: process_id/port are expected to be non-null exactly in these states.
    pub fn expects_process(&self) -> bool {
        matches!(
            self,
            AgentStatus::Starting | AgentStatus::Running | AgentStatus::Stopping
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A managed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
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

impl Agent {
    /// I4: error_message must be set iff status is Error.
    pub fn error_message_consistent(&self) -> bool {
        matches!(self.status, AgentStatus::Error) == self.error_message.is_some()
    }

    /// I3: process_id/port must both be set or both be unset, consistent with status.
    pub fn process_fields_consistent(&self) -> bool {
        let has_process = self.process_id.is_some() && self.port.is_some();
        has_process == self.status.expects_process()
    }
}

/// A valid name matches `^[A-Za-z0-9_-]+$`.
pub fn is_valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The agent configuration document: a handful of well-known, validated
/// fields plus an opaque extension map for anything else. Unknown keys are
/// preserved verbatim and never validated.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfigDocument {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub port: Option<u16>,

    /// Everything else, preserved but never validated.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentConfigDocument {
    /// `effective = deep_merge(template.config, user_config)`, user config
    /// wins on scalar/array keys.
    pub fn merged_with_user(&self, user: &AgentConfigDocument) -> AgentConfigDocument {
        AgentConfigDocument {
            model: user.model.clone().or_else(|| self.model.clone()),
            temperature: user.temperature.or(self.temperature),
            max_tokens: user.max_tokens.or(self.max_tokens),
            timeout_seconds: user.timeout_seconds.or(self.timeout_seconds),
            retry_attempts: user.retry_attempts.or(self.retry_attempts),
            system_prompt: user
                .system_prompt
                .clone()
                .or_else(|| self.system_prompt.clone()),
            tools: if user.tools.is_empty() {
                self.tools.clone()
            } else {
                user.tools.clone()
            },
            port: user.port.or(self.port),
            extra: {
                let mut merged = self.extra.clone();
                for (k, v) in &user.extra {
                    merged.insert(k.clone(), v.clone());
                }
                merged
            },
        }
    }

    /// Validate the well-known fields per `§3`/`§4`. Unknown fields are
    /// never validated.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.as_deref().unwrap_or("").is_empty() {
            return Err("model is required".to_string());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature {t} out of range [0.0, 2.0]"));
            }
        }
        if let Some(mt) = self.max_tokens {
            if !(1..=32_000).contains(&mt) {
                return Err(format!("max_tokens {mt} out of range [1, 32000]"));
            }
        }
        if let Some(ts) = self.timeout_seconds {
            if !(1..=300).contains(&ts) {
                return Err(format!("timeout_seconds {ts} out of range [1, 300]"));
            }
        }
        if let Some(p) = self.port {
            if !(1024..=65535).contains(&p) {
                return Err(format!("port {p} out of range [1024, 65535]"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_allows_alnum_dash_underscore() {
        assert!(is_valid_agent_name("agent-1_a"));
        assert!(!is_valid_agent_name("agent 1"));
        assert!(!is_valid_agent_name(""));
    }

    #[test]
    fn validate_requires_model() {
        let config = AgentConfigDocument::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_boundary_values() {
        let config = AgentConfigDocument {
            model: Some("gpt".into()),
            temperature: Some(2.0),
            max_tokens: Some(32_000),
            timeout_seconds: Some(300),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_just_past_boundary() {
        let config = AgentConfigDocument {
            model: Some("gpt".into()),
            temperature: Some(2.1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_prefers_user_scalars_and_keeps_template_fallbacks() {
        let template = AgentConfigDocument {
            model: Some("template-model".into()),
            temperature: Some(0.5),
            tools: vec!["search".into()],
            ..Default::default()
        };
        let user = AgentConfigDocument {
            temperature: Some(1.2),
            ..Default::default()
        };
        let merged = template.merged_with_user(&user);
        assert_eq!(merged.model.as_deref(), Some("template-model"));
        assert_eq!(merged.temperature, Some(1.2));
        assert_eq!(merged.tools, vec!["search".to_string()]);
    }

    #[test]
    fn process_fields_consistent_matches_status() {
        let mut agent = sample_agent();
        agent.status = AgentStatus::Running;
        agent.process_id = Some(123);
        agent.port = Some(3001);
        assert!(agent.process_fields_consistent());

        agent.status = AgentStatus::Stopped;
        assert!(!agent.process_fields_consistent());
    }

    fn sample_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "a".into(),
            description: None,
            status: AgentStatus::Stopped,
            config: AgentConfigDocument::default(),
            template_id: None,
            process_id: None,
            port: None,
            last_heartbeat: None,
            error_message: None,
            restart_count: 0,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
