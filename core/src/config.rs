/// Tunable constants for the supervisor/allocator/health-monitor triad.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default free-port range handed out to newly started agents.
pub const DEFAULT_PORT_MIN: u16 = 3001;
pub const DEFAULT_PORT_MAX: u16 = 3100;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_GRACE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_DEADLINE_MS: u64 = 30_000;

/// Configuration for `core`'s supervisor, allocator and health monitor.
///
/// Distinct from `daemon::config::DaemonConfig`, which owns the HTTP/auth
/// surface. Both are loaded and overridden the same way (TOML file, then
/// environment variables per the worker/daemon contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentdCoreConfig {
    /// Path to the worker binary the supervisor spawns for every agent.
    pub worker_binary: PathBuf,

    /// Path to the SQLite database file backing the `Store`.
    pub database_path: PathBuf,

    pub port_min: u16,
    pub port_max: u16,

    pub heartbeat_interval_ms: u64,
    pub ready_timeout_ms: u64,
    pub grace_timeout_ms: u64,
    pub max_restarts: u32,
    pub restart_backoff_ms: u64,
    pub shutdown_deadline_ms: u64,
}

impl Default for AgentdCoreConfig {
    fn default() -> Self {
        AgentdCoreConfig {
            worker_binary: PathBuf::from("agentd-worker"),
            database_path: PathBuf::from("agentd.sqlite"),
            port_min: DEFAULT_PORT_MIN,
            port_max: DEFAULT_PORT_MAX,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            grace_timeout_ms: DEFAULT_GRACE_TIMEOUT_MS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff_ms: DEFAULT_RESTART_BACKOFF_MS,
            shutdown_deadline_ms: DEFAULT_SHUTDOWN_DEADLINE_MS,
        }
    }
}

impl AgentdCoreConfig {
    /// Overlay environment variables per the worker/daemon `§6.3` contract.
    /// Unset variables leave the existing value untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AGENT_PORT_MIN") {
            if let Ok(p) = v.parse() {
                self.port_min = p;
            }
        }
        if let Ok(v) = std::env::var("AGENT_PORT_MAX") {
            if let Ok(p) = v.parse() {
                self.port_max = p;
            }
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL_MS") {
            if let Ok(p) = v.parse() {
                self.heartbeat_interval_ms = p;
            }
        }
        if let Ok(v) = std::env::var("READY_TIMEOUT_MS") {
            if let Ok(p) = v.parse() {
                self.ready_timeout_ms = p;
            }
        }
        if let Ok(v) = std::env::var("GRACE_TIMEOUT_MS") {
            if let Ok(p) = v.parse() {
                self.grace_timeout_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MAX_RESTARTS") {
            if let Ok(p) = v.parse() {
                self.max_restarts = p;
            }
        }
        if let Ok(v) = std::env::var("RESTART_BACKOFF_MS") {
            if let Ok(p) = v.parse() {
                self.restart_backoff_ms = p;
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.port_min == 0 || self.port_max == 0 {
            return Err("port_min/port_max must be non-zero".to_string());
        }
        if self.port_min > self.port_max {
            return Err("port_min must be <= port_max".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be > 0".to_string());
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ready_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn grace_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn restart_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn shutdown_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_deadline_ms)
    }

    /// Heartbeat staleness threshold used by the `HealthMonitor`: `2 * HEARTBEAT_INTERVAL`.
    pub fn stale_threshold(&self) -> std::time::Duration {
        self.heartbeat_interval() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AgentdCoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = AgentdCoreConfig::default();
        config.port_min = 4000;
        config.port_max = 3000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stale_threshold_is_double_heartbeat_interval() {
        let config = AgentdCoreConfig::default();
        assert_eq!(config.stale_threshold(), config.heartbeat_interval() * 2);
    }
}
