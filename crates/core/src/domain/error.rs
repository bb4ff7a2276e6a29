// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidJobTransition { from: String, to: String },

    #[error("Invalid task status transition: {from} -> {to}")]
    InvalidTaskTransition { from: String, to: String },

    #[error("Checkpoint phase regression: {current} -> {requested}")]
    CheckpointRegression { current: u32, requested: u32 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
