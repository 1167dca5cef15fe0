//! Error types for blockhaus
//!
//! All errors in the application are converted to `AppError`. Only the
//! configuration, authentication, and persistence variants terminate the
//! process; per-target failures are absorbed into outcome records by the
//! processing manager and never surface here.

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed configuration input (cookie jar, target list,
    /// unwritable paths). Fatal, non-zero exit.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session rejected after one recovery attempt. Fatal to the run.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Persistence error. Fatal: the outcome log is the source of truth,
    /// continuing would risk duplicate block calls on restart.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP transport error surfaced outside the per-target path.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned something the client cannot work with.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Process exit code for fatal errors.
    ///
    /// Target-level failures are data, not process failures; anything that
    /// reaches process exit through this mapping is an operator problem.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Auth(_) => 3,
            AppError::Database(_) => 4,
            _ => 1,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
