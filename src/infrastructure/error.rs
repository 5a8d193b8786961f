use crate::domain::models::PropertyId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("ICS fetch error: {0}")]
    Fetch(String),
    #[error("ICS fetch timed out after {0}ms")]
    Timeout(u64),
    #[error("ICS parse error: {0}")]
    Parse(String),
    #[error("Requires an existing property: {0}")]
    StagingUnsupported(String),
    #[error("Calendar sync already in progress for property {0}")]
    SyncInProgress(PropertyId),
    #[error("Calendar sync cancelled")]
    Cancelled,
}

impl InfraError {
    /// Network-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Fetch(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("network error")
                    || message.contains("http 5")
                    || message.contains("connection reset")
                    || message.contains("temporarily unavailable")
            }
            _ => false,
        }
    }
}
