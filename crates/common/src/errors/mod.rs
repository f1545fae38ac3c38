//! Error types for PaperIntake services
//!
//! Provides the shared error type used by every collaborator:
//! - Distinct error variants for each external dependency
//! - Unique-key violations surfaced as [`AppError::Duplicate`]
//! - Classification helpers used by the ingestion failure policy

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    // Conflict errors
    #[error("Duplicate resource: {message}")]
    Duplicate { message: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Queue error: {message}")]
    QueueError { message: String },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("Storage error: {message}")]
    StorageError { message: String },

    #[error("Enrichment lookup error: {message}")]
    EnrichmentError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Input problems that no amount of redelivery will fix
    pub fn is_malformed(&self) -> bool {
        matches!(self, AppError::Validation { .. } | AppError::Serialization(_))
    }

    /// The resource already exists; callers treat this as a no-op
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppError::Duplicate { .. })
    }

    /// The addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound { .. })
    }

    /// A transport-level failure reaching a remote service
    pub fn is_connectivity(&self) -> bool {
        match self {
            AppError::HttpClient(e) => e.is_connect() || e.is_timeout(),
            AppError::DatabaseConnection { .. } => true,
            AppError::Database(DbErr::ConnectionAcquire(_) | DbErr::Conn(_)) => true,
            _ => false,
        }
    }
}

impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(message)) => AppError::Duplicate { message },
            _ => AppError::Database(err),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError {
            message: err.to_string(),
        }
    }
}
