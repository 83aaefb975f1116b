/// Error types for the agent supervisor core.
use thiserror::Error;

/// Errors produced by the `Store`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("name '{0}' already exists")]
    DuplicateName(String),

    #[error("process id already claimed")]
    DuplicateProcessId,

    #[error("port {0} already claimed")]
    DuplicatePort(u16),

    #[error("agent not found: {0}")]
    AgentNotFound(uuid::Uuid),

    #[error("template not found: {0}")]
    TemplateNotFound(uuid::Uuid),

    #[error("user not found: {0}")]
    UserNotFound(uuid::Uuid),

    #[error("conflicting state: expected status {expected}, row has moved on")]
    ConflictingState { expected: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by the `AgentController`.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state: agent is {current}, operation requires {required}")]
    ConflictingState { current: String, required: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("startup timed out waiting for agent to become ready")]
    StartupTimeout,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors produced by the `ProcessSupervisor`.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("agent {0} is not registered with the supervisor")]
    NotRegistered(uuid::Uuid),

    #[error("signal delivery failed: {0}")]
    SignalFailed(String),

    #[error("startup timed out")]
    StartupTimeout,
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
