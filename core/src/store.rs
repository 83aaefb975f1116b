/// SQLite-backed persistence for users, templates, and agents.
///
/// CAS updates are implemented the way `lease_manager.rs` implements lease
/// renewal: a conditional `UPDATE ... WHERE` statement whose `rows_affected()`
/// tells the caller whether the row moved in the expected way. Uniqueness is
/// enforced by real schema constraints (`UNIQUE(name)`, partial unique
/// indexes on `process_id`/`port`), not a convention the caller has to keep.
use crate::errors::{StoreError, StoreResult};
use crate::models::{Agent, AgentConfigDocument, AgentStatus, AgentTemplate, Role, User};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

pub struct Store {
    pool: SqlitePool,
}

/// Filter/page/sort parameters for `list_agents`.
#[derive(Debug, Clone, Default)]
pub struct AgentListQuery {
    pub owner_id: Option<Uuid>,
    pub status: Option<AgentStatus>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
    pub sort_by: AgentSortKey,
    pub sort_desc: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentSortKey {
    #[default]
    CreatedAt,
    Name,
    Status,
}

impl AgentSortKey {
    fn column(&self) -> &'static str {
        match self {
            AgentSortKey::CreatedAt => "created_at",
            AgentSortKey::Name => "name",
            AgentSortKey::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentStatusCounts {
    pub stopped: u64,
    pub starting: u64,
    pub running: u64,
    pub stopping: u64,
    pub error: u64,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub stream: LogStream,
    pub line: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> LogStream {
        if s == "stderr" {
            LogStream::Stderr
        } else {
            LogStream::Stdout
        }
    }
}

/// A refresh-token session backing `POST /api/auth/refresh` rotation.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MetricSample {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub rss_bytes: i64,
    pub heap_total_bytes: i64,
    pub heap_used_bytes: i64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Fields `AgentController`/`ProcessSupervisor` are allowed to update via CAS.
#[derive(Debug, Clone, Default)]
pub struct AgentFieldUpdate {
    pub status: Option<AgentStatus>,
    pub process_id: Option<Option<u32>>,
    pub port: Option<Option<u16>>,
    pub last_heartbeat: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub restart_count: Option<u32>,
    pub config: Option<AgentConfigDocument>,
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

impl Store {
    pub async fn connect(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvariantViolation(format!(
                        "failed to create database directory: {e}"
                    ))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(&db_path.to_string_lossy())
            .map_err(|e| StoreError::Database(sqlx::Error::Configuration(Box::new(e))))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_options)
            .await?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_templates (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                config TEXT NOT NULL,
                version TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_active_name
                ON agent_templates(name) WHERE is_active = 1;
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                template_id TEXT,
                process_id INTEGER,
                port INTEGER,
                last_heartbeat TEXT,
                error_message TEXT,
                restart_count INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_process_id
                ON agents(process_id) WHERE process_id IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_port
                ON agents(port) WHERE port IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_agents_created_by ON agents(created_by);
            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_logs (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                stream TEXT NOT NULL,
                line TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_logs_agent ON agent_logs(agent_id, recorded_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_metrics (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                rss_bytes INTEGER NOT NULL,
                heap_total_bytes INTEGER NOT NULL,
                heap_used_bytes INTEGER NOT NULL,
                cpu_user REAL NOT NULL,
                cpu_system REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_metrics_agent ON agent_metrics(agent_id, recorded_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_sessions (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                refresh_token_hash TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_user_sessions_user ON user_sessions(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_alerts (
                id TEXT PRIMARY KEY NOT NULL,
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL,
                acknowledged_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agent_alerts_agent ON agent_alerts(agent_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- users ----

    pub async fn create_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, role, is_active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &user.username, None))?;
        Ok(())
    }

    pub async fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, email, password_hash, role, is_active, created_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_user).transpose()
    }

    pub async fn get_user_by_id(&self, id: Uuid) -> StoreResult<User> {
        let row = sqlx::query(
            "SELECT id, username, email, password_hash, role, is_active, created_at
             FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => row_to_user(r),
            None => Err(StoreError::UserNotFound(id)),
        }
    }

    // ---- templates ----

    pub async fn create_template(&self, template: &AgentTemplate) -> StoreResult<()> {
        if template.is_active {
            self.deactivate_template_by_name(&template.name).await?;
        }
        sqlx::query(
            "INSERT INTO agent_templates
                (id, name, description, config, version, is_active, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.description)
        .bind(serde_json::to_string(&template.config)?)
        .bind(&template.version)
        .bind(template.is_active)
        .bind(template.created_by.to_string())
        .bind(template.created_at.to_rfc3339())
        .bind(template.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &template.name, None))?;
        Ok(())
    }

    async fn deactivate_template_by_name(&self, name: &str) -> StoreResult<()> {
        sqlx::query("UPDATE agent_templates SET is_active = 0 WHERE name = ? AND is_active = 1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_template(&self, id: Uuid) -> StoreResult<AgentTemplate> {
        let row = sqlx::query(
            "SELECT id, name, description, config, version, is_active, created_by, created_at, updated_at
             FROM agent_templates WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => row_to_template(r),
            None => Err(StoreError::TemplateNotFound(id)),
        }
    }

    pub async fn get_active_template_by_name(
        &self,
        name: &str,
    ) -> StoreResult<Option<AgentTemplate>> {
        let row = sqlx::query(
            "SELECT id, name, description, config, version, is_active, created_by, created_at, updated_at
             FROM agent_templates WHERE name = ? AND is_active = 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_template).transpose()
    }

    /// Soft-deactivate: the row stays so agents still referencing it by
    /// `template_id` keep a valid foreign value.
    pub async fn deactivate_template(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agent_templates SET is_active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TemplateNotFound(id));
        }
        Ok(())
    }

    pub async fn list_templates(&self) -> StoreResult<Vec<AgentTemplate>> {
        let rows = sqlx::query(
            "SELECT id, name, description, config, version, is_active, created_by, created_at, updated_at
             FROM agent_templates ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_template).collect()
    }

    // ---- agents ----

    pub async fn create_agent(&self, agent: &Agent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agents
                (id, name, description, status, config, template_id, process_id, port,
                 last_heartbeat, error_message, restart_count, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(agent.status.as_str())
        .bind(serde_json::to_string(&agent.config)?)
        .bind(agent.template_id.map(|id| id.to_string()))
        .bind(agent.process_id.map(|p| p as i64))
        .bind(agent.port.map(|p| p as i64))
        .bind(agent.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(&agent.error_message)
        .bind(agent.restart_count)
        .bind(agent.created_by.to_string())
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &agent.name, agent.port))?;
        Ok(())
    }

    pub async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        let row = sqlx::query(&agent_select("WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => row_to_agent(r),
            None => Err(StoreError::AgentNotFound(id)),
        }
    }

    /// CAS: succeeds only if the row's current status is `expected_status`
    /// (or `expected_status` is `None`, meaning "don't check status").
    ///
    /// Reads the current row to fill in fields the caller didn't touch, then
    /// writes a single fixed-column `UPDATE ... WHERE id = ? [AND status = ?]`
    /// so the `rows_affected()` check on that one statement is the entire CAS.
    pub async fn update_agent_fields(
        &self,
        id: Uuid,
        expected_status: Option<AgentStatus>,
        update: AgentFieldUpdate,
    ) -> StoreResult<()> {
        let current = self.get_agent(id).await?;

        let status = update.status.unwrap_or(current.status);
        let error_message = update
            .error_message
            .clone()
            .unwrap_or(current.error_message.clone());
        if (status == AgentStatus::Error) != error_message.is_some() {
            return Err(StoreError::InvariantViolation(
                "error_message must be set iff status is error".to_string(),
            ));
        }

        let name = update.name.clone().unwrap_or(current.name.clone());
        let description = update
            .description
            .clone()
            .unwrap_or(current.description.clone());
        let config = update.config.clone().unwrap_or(current.config.clone());
        let process_id = update.process_id.unwrap_or(current.process_id);
        let port = update.port.unwrap_or(current.port);
        let last_heartbeat = update.last_heartbeat.unwrap_or(current.last_heartbeat);
        let restart_count = update.restart_count.unwrap_or(current.restart_count);
        let now = Utc::now();

        let mut query_str = "UPDATE agents SET status = ?, name = ?, description = ?, config = ?,
             process_id = ?, port = ?, last_heartbeat = ?, error_message = ?,
             restart_count = ?, updated_at = ? WHERE id = ?"
            .to_string();
        if expected_status.is_some() {
            query_str.push_str(" AND status = ?");
        }

        let mut q = sqlx::query(&query_str)
            .bind(status.as_str())
            .bind(name)
            .bind(description)
            .bind(serde_json::to_string(&config)?)
            .bind(process_id.map(|p| p as i64))
            .bind(port.map(|p| p as i64))
            .bind(last_heartbeat.map(|t| t.to_rfc3339()))
            .bind(error_message)
            .bind(restart_count)
            .bind(now.to_rfc3339())
            .bind(id.to_string());
        if let Some(expected) = expected_status {
            q = q.bind(expected.as_str());
        }

        let result = q.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConflictingState {
                expected: expected_status
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "any".to_string()),
            });
        }

        Ok(())
    }

    /// Only callable when the row's status is `stopped` or `error` (I-level
    /// enforcement mirrors the CAS check in `update_agent_fields`).
    pub async fn delete_agent(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM agents WHERE id = ? AND status IN ('stopped', 'error')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConflictingState {
                expected: "stopped or error".to_string(),
            });
        }
        Ok(())
    }

    pub async fn list_agents(&self, query: &AgentListQuery) -> StoreResult<Vec<Agent>> {
        let mut sql = agent_select("WHERE 1 = 1");
        if query.owner_id.is_some() {
            sql.push_str(" AND created_by = ?");
        }
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.search.is_some() {
            sql.push_str(" AND name LIKE ?");
        }
        sql.push_str(&format!(
            " ORDER BY {} {}",
            query.sort_by.column(),
            if query.sort_desc { "DESC" } else { "ASC" }
        ));
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(owner) = query.owner_id {
            q = q.bind(owner.to_string());
        }
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        if let Some(search) = &query.search {
            q = q.bind(format!("%{search}%"));
        }
        let limit = query.limit.max(1);
        let offset = query.page.saturating_sub(1) * limit;
        q = q.bind(limit).bind(offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_agent).collect()
    }

    /// Total rows matching `query`'s filters, ignoring `page`/`limit` — the
    /// `total` field of a paginated `AgentListResponse`.
    pub async fn count_agents(&self, query: &AgentListQuery) -> StoreResult<u64> {
        let mut sql = "SELECT COUNT(*) as n FROM agents WHERE 1 = 1".to_string();
        if query.owner_id.is_some() {
            sql.push_str(" AND created_by = ?");
        }
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.search.is_some() {
            sql.push_str(" AND name LIKE ?");
        }

        let mut q = sqlx::query(&sql);
        if let Some(owner) = query.owner_id {
            q = q.bind(owner.to_string());
        }
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        if let Some(search) = &query.search {
            q = q.bind(format!("%{search}%"));
        }
        let row = q.fetch_one(&self.pool).await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    pub async fn count_by_status(&self, owner_id: Option<Uuid>) -> StoreResult<AgentStatusCounts> {
        let mut sql = "SELECT status, COUNT(*) as n FROM agents WHERE 1 = 1".to_string();
        if owner_id.is_some() {
            sql.push_str(" AND created_by = ?");
        }
        sql.push_str(" GROUP BY status");

        let mut q = sqlx::query(&sql);
        if let Some(owner) = owner_id {
            q = q.bind(owner.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut counts = AgentStatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.as_str() {
                "stopped" => counts.stopped = n as u64,
                "starting" => counts.starting = n as u64,
                "running" => counts.running = n as u64,
                "stopping" => counts.stopping = n as u64,
                "error" => counts.error = n as u64,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Ports currently claimed in `[min, max]`, used by the `PortAllocator`.
    pub async fn find_ports_in_range(&self, min: u16, max: u16) -> StoreResult<Vec<u16>> {
        let rows = sqlx::query(
            "SELECT port FROM agents WHERE port IS NOT NULL AND port >= ? AND port <= ?",
        )
        .bind(min as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("port") as u16)
            .collect())
    }

    /// Agents whose status is `running` and whose `last_heartbeat` is either
    /// absent or older than `threshold`.
    pub async fn find_stale_running(
        &self,
        threshold: chrono::Duration,
    ) -> StoreResult<Vec<Agent>> {
        let cutoff = (Utc::now() - threshold).to_rfc3339();
        let rows = sqlx::query(&agent_select(
            "WHERE status = 'running' AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_agent).collect()
    }

    // ---- append-only logs/metrics ----

    pub async fn append_log(&self, record: &LogRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agent_logs (id, agent_id, stream, line, recorded_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.agent_id.to_string())
        .bind(record.stream.as_str())
        .bind(&record.line)
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_logs(&self, agent_id: Uuid, limit: u32) -> StoreResult<Vec<LogRecord>> {
        let rows = sqlx::query(
            "SELECT id, agent_id, stream, line, recorded_at FROM agent_logs
             WHERE agent_id = ? ORDER BY recorded_at DESC LIMIT ?",
        )
        .bind(agent_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LogRecord {
                    id: parse_uuid(row.get("id"))?,
                    agent_id: parse_uuid(row.get("agent_id"))?,
                    stream: LogStream::parse(&row.get::<String, _>("stream")),
                    line: row.get("line"),
                    recorded_at: parse_timestamp(row.get("recorded_at"))?,
                })
            })
            .collect()
    }

    pub async fn append_metric_sample(&self, sample: &MetricSample) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agent_metrics
                (id, agent_id, rss_bytes, heap_total_bytes, heap_used_bytes, cpu_user, cpu_system, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sample.id.to_string())
        .bind(sample.agent_id.to_string())
        .bind(sample.rss_bytes)
        .bind(sample.heap_total_bytes)
        .bind(sample.heap_used_bytes)
        .bind(sample.cpu_user)
        .bind(sample.cpu_system)
        .bind(sample.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_metric_samples(
        &self,
        agent_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<MetricSample>> {
        let rows = sqlx::query(
            "SELECT id, agent_id, rss_bytes, heap_total_bytes, heap_used_bytes, cpu_user, cpu_system, recorded_at
             FROM agent_metrics WHERE agent_id = ? ORDER BY recorded_at DESC LIMIT ?",
        )
        .bind(agent_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(MetricSample {
                    id: parse_uuid(row.get("id"))?,
                    agent_id: parse_uuid(row.get("agent_id"))?,
                    rss_bytes: row.get("rss_bytes"),
                    heap_total_bytes: row.get("heap_total_bytes"),
                    heap_used_bytes: row.get("heap_used_bytes"),
                    cpu_user: row.get("cpu_user"),
                    cpu_system: row.get("cpu_system"),
                    recorded_at: parse_timestamp(row.get("recorded_at"))?,
                })
            })
            .collect()
    }

    // ---- user sessions (refresh-token rotation) ----

    pub async fn create_session(&self, session: &UserSession) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_sessions (id, user_id, refresh_token_hash, issued_at, expires_at, revoked_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.refresh_token_hash)
        .bind(session.issued_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .bind(session.revoked_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Looks up a still-valid (unrevoked, unexpired) session by the hash of
    /// the presented refresh token.
    pub async fn get_active_session_by_hash(
        &self,
        refresh_token_hash: &str,
    ) -> StoreResult<Option<UserSession>> {
        let row = sqlx::query(
            "SELECT id, user_id, refresh_token_hash, issued_at, expires_at, revoked_at
             FROM user_sessions
             WHERE refresh_token_hash = ? AND revoked_at IS NULL",
        )
        .bind(refresh_token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_session).transpose()
    }

    pub async fn revoke_session(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE user_sessions SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Used by `HealthMonitor` to write a row for each forced error transition.
    pub async fn append_alert(&self, agent_id: Uuid, kind: &str, message: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agent_alerts (id, agent_id, kind, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(agent_id.to_string())
        .bind(kind)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn agent_select(clause: &str) -> String {
    format!(
        "SELECT id, name, description, status, config, template_id, process_id, port,
                last_heartbeat, error_message, restart_count, created_by, created_at, updated_at
         FROM agents {clause}"
    )
}

fn map_unique_violation(e: sqlx::Error, name: &str, port: Option<u16>) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE constraint failed") {
            if db_err.message().contains("agents.name")
                || db_err.message().contains("agent_templates.name")
            {
                return StoreError::DuplicateName(name.to_string());
            }
            if db_err.message().contains("process_id") {
                return StoreError::DuplicateProcessId;
            }
            if db_err.message().contains("port") {
                return StoreError::DuplicatePort(port.unwrap_or(0));
            }
        }
    }
    StoreError::Database(e)
}

fn parse_uuid(s: String) -> StoreResult<Uuid> {
    Uuid::parse_str(&s)
        .map_err(|e| StoreError::InvariantViolation(format!("invalid uuid in row: {e}")))
}

fn parse_timestamp(s: String) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvariantViolation(format!("invalid timestamp in row: {e}")))
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> StoreResult<User> {
    Ok(User {
        id: parse_uuid(row.get("id"))?,
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: Role::from_str(&row.get::<String, _>("role"))
            .map_err(StoreError::InvariantViolation)?,
        is_active: row.get("is_active"),
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn row_to_template(row: sqlx::sqlite::SqliteRow) -> StoreResult<AgentTemplate> {
    Ok(AgentTemplate {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        description: row.get("description"),
        config: serde_json::from_str(&row.get::<String, _>("config"))?,
        version: row.get("version"),
        is_active: row.get("is_active"),
        created_by: parse_uuid(row.get("created_by"))?,
        created_at: parse_timestamp(row.get("created_at"))?,
        updated_at: parse_timestamp(row.get("updated_at"))?,
    })
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> StoreResult<UserSession> {
    let revoked_at: Option<String> = row.get("revoked_at");
    Ok(UserSession {
        id: parse_uuid(row.get("id"))?,
        user_id: parse_uuid(row.get("user_id"))?,
        refresh_token_hash: row.get("refresh_token_hash"),
        issued_at: parse_timestamp(row.get("issued_at"))?,
        expires_at: parse_timestamp(row.get("expires_at"))?,
        revoked_at: revoked_at.map(parse_timestamp).transpose()?,
    })
}

fn row_to_agent(row: sqlx::sqlite::SqliteRow) -> StoreResult<Agent> {
    let status_str: String = row.get("status");
    let status = match status_str.as_str() {
        "stopped" => AgentStatus::Stopped,
        "starting" => AgentStatus::Starting,
        "running" => AgentStatus::Running,
        "stopping" => AgentStatus::Stopping,
        "error" => AgentStatus::Error,
        other => {
            return Err(StoreError::InvariantViolation(format!(
                "unknown agent status in row: {other}"
            )))
        }
    };

    let template_id: Option<String> = row.get("template_id");
    let last_heartbeat: Option<String> = row.get("last_heartbeat");

    Ok(Agent {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        description: row.get("description"),
        status,
        config: serde_json::from_str(&row.get::<String, _>("config"))?,
        template_id: template_id.map(|s| parse_uuid(s)).transpose()?,
        process_id: row.get::<Option<i64>, _>("process_id").map(|p| p as u32),
        port: row.get::<Option<i64>, _>("port").map(|p| p as u16),
        last_heartbeat: last_heartbeat.map(parse_timestamp).transpose()?,
        error_message: row.get("error_message"),
        restart_count: row.get::<i64, _>("restart_count") as u32,
        created_by: parse_uuid(row.get("created_by"))?,
        created_at: parse_timestamp(row.get("created_at"))?,
        updated_at: parse_timestamp(row.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentConfigDocument;

    fn sample_agent(owner: Uuid, name: &str) -> Agent {
        let now = Utc::now();
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            status: AgentStatus::Stopped,
            config: AgentConfigDocument {
                model: Some("gpt".into()),
                ..Default::default()
            },
            template_id: None,
            process_id: None,
            port: None,
            last_heartbeat: None,
            error_message: None,
            restart_count: 0,
            created_by: owner,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_and_get_agent_roundtrips() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let agent = sample_agent(owner, "agent-one");
        store.create_agent(&agent).await.unwrap();

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.name, "agent-one");
        assert_eq!(fetched.status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let a = sample_agent(owner, "dup");
        let b = sample_agent(owner, "dup");
        store.create_agent(&a).await.unwrap();
        let result = store.create_agent(&b).await;
        assert!(matches!(result, Err(StoreError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn cas_update_fails_on_status_mismatch() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let agent = sample_agent(owner, "cas");
        store.create_agent(&agent).await.unwrap();

        let result = store
            .update_agent_fields(
                agent.id,
                Some(AgentStatus::Running),
                AgentFieldUpdate {
                    status: Some(AgentStatus::Starting),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::ConflictingState { .. })));
    }

    #[tokio::test]
    async fn cas_update_succeeds_and_sets_process_fields() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let agent = sample_agent(owner, "cas2");
        store.create_agent(&agent).await.unwrap();

        store
            .update_agent_fields(
                agent.id,
                Some(AgentStatus::Stopped),
                AgentFieldUpdate {
                    status: Some(AgentStatus::Starting),
                    port: Some(Some(3001)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.status, AgentStatus::Starting);
        assert_eq!(fetched.port, Some(3001));
    }

    #[tokio::test]
    async fn error_message_invariant_enforced() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let agent = sample_agent(owner, "inv");
        store.create_agent(&agent).await.unwrap();

        let result = store
            .update_agent_fields(
                agent.id,
                None,
                AgentFieldUpdate {
                    status: Some(AgentStatus::Error),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn delete_forbidden_while_running() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let mut agent = sample_agent(owner, "run");
        agent.status = AgentStatus::Running;
        agent.process_id = Some(111);
        agent.port = Some(3001);
        store.create_agent(&agent).await.unwrap();

        let result = store.delete_agent(agent.id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn find_ports_in_range_reflects_claims() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let mut agent = sample_agent(owner, "ported");
        agent.status = AgentStatus::Running;
        agent.process_id = Some(1);
        agent.port = Some(3002);
        store.create_agent(&agent).await.unwrap();

        let ports = store.find_ports_in_range(3001, 3100).await.unwrap();
        assert_eq!(ports, vec![3002]);
    }

    #[tokio::test]
    async fn list_agents_filters_by_owner() {
        let store = Store::connect_in_memory().await.unwrap();
        let owner_a = Uuid::new_v4();
        let owner_b = Uuid::new_v4();
        store.create_agent(&sample_agent(owner_a, "a1")).await.unwrap();
        store.create_agent(&sample_agent(owner_b, "b1")).await.unwrap();

        let query = AgentListQuery {
            owner_id: Some(owner_a),
            page: 1,
            limit: 10,
            ..Default::default()
        };
        let agents = store.list_agents(&query).await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "a1");
    }

    #[tokio::test]
    async fn session_lookup_excludes_revoked() {
        let store = Store::connect_in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let session = UserSession {
            id: Uuid::new_v4(),
            user_id,
            refresh_token_hash: "hash-1".to_string(),
            issued_at: now,
            expires_at: now + chrono::Duration::days(7),
            revoked_at: None,
        };
        store.create_session(&session).await.unwrap();

        let found = store
            .get_active_session_by_hash("hash-1")
            .await
            .unwrap()
            .expect("session should be active");
        assert_eq!(found.user_id, user_id);

        store.revoke_session(session.id).await.unwrap();
        let after_revoke = store.get_active_session_by_hash("hash-1").await.unwrap();
        assert!(after_revoke.is_none());
    }
}
