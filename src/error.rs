use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the engine.
///
/// The taxonomy matters for the release worker: `ExternalService` is the only
/// retryable class (Step A/B ordering guarantees no funds moved), while
/// `Reconciliation` bypasses retry entirely and escalates to operators.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Manual reconciliation required for pool {pool_id}: {message}")]
    Reconciliation {
        pool_id: Uuid,
        transfer_reference: Option<String>,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the queue may retry the failed job. Only external transfer
    /// failures are safe to retry: the escrow was reverted to `Failed` before
    /// the error surfaced, so no funds have moved.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ExternalService(_))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalService(format!("HTTP request error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
