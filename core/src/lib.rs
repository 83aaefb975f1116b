//! agentd-core: data model, persistence, and process supervision for the
//! multi-tenant agent process supervisor.

pub mod config;
pub mod controller;
pub mod errors;
pub mod event_loop;
pub mod health_monitor;
pub mod models;
pub mod port_allocator;
pub mod store;
pub mod stream_parser;
pub mod supervisor;

pub use config::AgentdCoreConfig;
pub use controller::{AgentController, CreateAgentRequest, Principal, UpdateAgentRequest};
pub use errors::{ControllerError, ControllerResult, StoreError, StoreResult, SupervisorError, SupervisorResult};
pub use event_loop::SupervisorEventLoop;
pub use health_monitor::HealthMonitor;
pub use models::{Agent, AgentConfigDocument, AgentStatus, AgentTemplate, Role, User};
pub use port_allocator::PortAllocator;
pub use store::{
    AgentFieldUpdate, AgentListQuery, AgentSortKey, AgentStatusCounts, LogRecord, LogStream,
    MetricSample, Store, UserSession,
};
pub use stream_parser::{parse_line, MetricsRecord, WorkerRecord};
pub use supervisor::{LogStreamKind, ProcessSupervisor, SpawnSpec, SupervisorEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
