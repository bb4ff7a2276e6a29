// Central Error Type for the Engine

use thiserror::Error;

/// Engine-level error type covering the orchestration error taxonomy.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Message lock lost: {0}")]
    LockLost(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

// Note: sqlx::Error conversion is handled in infra-sqlite by mapping to
// EngineError::Database (orphan rules prevent a From impl there).
