//! agentd-daemon: the REST API surface, authentication, and configuration
//! for the multi-tenant agent process supervisor.

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;
pub mod types;

pub use config::DaemonConfig;
pub use errors::{DaemonError, DaemonResult};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
