//! Error types for RDM core

use rdm_types::TaskId;
use thiserror::Error;

/// Errors that can occur in RDM core
#[derive(Debug, Error)]
pub enum RdmError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The engine has been shut down or its event channel is closed
    #[error("Engine unavailable")]
    Unavailable,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for RdmError {
    fn from(error: serde_json::Error) -> Self {
        RdmError::Serialization(error.to_string())
    }
}

impl From<RdmError> for String {
    fn from(error: RdmError) -> Self {
        error.to_string()
    }
}
