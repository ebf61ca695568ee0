//! Error taxonomy for the reconciliation engine and its stores.

use service_core::error::AppError;
use thiserror::Error;

pub type Result<T, E = ReconciliationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A match result already exists for the record.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(anyhow::Error),

    /// A rule in the active set has no handler.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ReconciliationError {
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(anyhow::anyhow!("{}: {}", context, err))
    }

    /// Only storage failures are worth another attempt; everything else is
    /// deterministic for the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage",
            Self::InvalidRule(_) => "invalid_rule",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<sqlx::Error> for ReconciliationError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(anyhow::Error::new(err))
    }
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ReconciliationError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ReconciliationError::Storage(e) => AppError::DatabaseError(e),
            ReconciliationError::InvalidRule(msg) => {
                AppError::InternalError(anyhow::anyhow!("Invalid rule: {}", msg))
            }
            ReconciliationError::InvalidInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
        }
    }
}
