/// Daemon configuration: HTTP surface, auth, and logging. Loaded from an
/// optional TOML file with `Default`, then overlaid with CLI flags and the
/// `§6.3` environment variables.
use crate::errors::DaemonError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            cors_origin: "*".to_string(),
        }
    }
}

/// Authentication configuration: JWT secrets/lifetimes for the access and
/// refresh token pair issued by `POST /api/auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_expiry_secs: u64,
    pub refresh_token_expiry_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            jwt_secret: "default-secret-change-in-production".to_string(),
            access_token_expiry_secs: 900,
            refresh_token_expiry_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("failed to parse config: {e}")))
    }

    pub fn load_or_default(path: Option<&str>) -> Result<Self, DaemonError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Overlay `§6.3` environment variables. `DB_*`/`REDIS_*` are read and
    /// intentionally discarded: they're reserved for a future non-SQLite
    /// backend this Store doesn't have.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("CORS_ORIGIN") {
            self.server.cors_origin = v;
        }
        if let Ok(v) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("JWT_EXPIRES_IN") {
            if let Ok(p) = v.parse() {
                self.auth.access_token_expiry_secs = p;
            }
        }
        if let Ok(v) = std::env::var("JWT_REFRESH_EXPIRES_IN") {
            if let Ok(p) = v.parse() {
                self.auth.refresh_token_expiry_secs = p;
            }
        }
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.server.port == 0 {
            return Err(DaemonError::Config("server.port must be non-zero".to_string()));
        }
        if self.auth.jwt_secret == "default-secret-change-in-production" {
            return Err(DaemonError::Config(
                "JWT_SECRET must be changed from the default".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_on_default_secret() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_port_and_secret() {
        std::env::set_var("PORT", "9999");
        std::env::set_var("JWT_SECRET", "a-real-secret");
        let mut config = DaemonConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("PORT");
        std::env::remove_var("JWT_SECRET");

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.auth.jwt_secret, "a-real-secret");
        assert!(config.validate().is_ok());
    }
}
