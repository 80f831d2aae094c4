//! Error types for ExpertMatch retrieval
//!
//! Provides a single error taxonomy with:
//! - Distinct variants for validation, database, graph and upstream failures
//! - Machine-readable error codes
//! - Detection of the backend's transient "transaction aborted" condition

use sea_orm::{DbErr, RuntimeErr};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// SQLSTATE raised by PostgreSQL when the current transaction is aborted
pub const SQLSTATE_TRANSACTION_ABORTED: &str = "25P02";

/// SQLSTATE raised by PostgreSQL when a function does not exist
pub const SQLSTATE_UNDEFINED_FUNCTION: &str = "42883";

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,
    GraphQueryError,
    GraphParameterError,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingError,
    LlmError,
    Timeout,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::GraphQueryError => 7101,
            ErrorCode::GraphParameterError => 7102,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::LlmError => 8003,
            ErrorCode::Timeout => 8004,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Stage of a graph query at which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    BuildingQuery,
    ParameterEmbedding,
    ArityInference,
    Executing,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryPhase::BuildingQuery => "building_query",
            QueryPhase::ParameterEmbedding => "parameter_embedding",
            QueryPhase::ArityInference => "arity_inference",
            QueryPhase::Executing => "executing",
        };
        f.write_str(name)
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // Graph errors
    #[error("Graph query failed during {phase}: {message} (query: {query})")]
    GraphQuery {
        phase: QueryPhase,
        query: String,
        message: String,
    },

    #[error("Graph parameter '{name}' invalid: {message}")]
    GraphParameter { name: String, message: String },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Reasoning model error: {message}")]
    LlmError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::GraphQuery { .. } => ErrorCode::GraphQueryError,
            AppError::GraphParameter { .. } => ErrorCode::GraphParameterError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::LlmError { .. } => ErrorCode::LlmError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Shorthand for a validation error on a named field
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    /// Caller misuse; the only class that is fatal to a retrieval call
    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::Validation { .. })
    }

    /// Whether the error wraps the backend's aborted-transaction signal
    pub fn is_transaction_aborted(&self) -> bool {
        match self {
            AppError::Database(err) => is_transaction_aborted(err),
            AppError::GraphQuery { message, .. } => message_is_transaction_aborted(message),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field = errors.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: errors.to_string(),
            field,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Extract the SQLSTATE code from a database error, if the driver exposed one
pub fn sqlstate(err: &DbErr) -> Option<String> {
    let runtime = match err {
        DbErr::Query(runtime) | DbErr::Exec(runtime) | DbErr::Conn(runtime) => runtime,
        _ => return None,
    };

    match runtime {
        RuntimeErr::SqlxError(sqlx::Error::Database(db_err)) => {
            db_err.code().map(|code| code.into_owned())
        }
        _ => None,
    }
}

/// Whether a database error is PostgreSQL's "current transaction is aborted" (25P02)
pub fn is_transaction_aborted(err: &DbErr) -> bool {
    if sqlstate(err).as_deref() == Some(SQLSTATE_TRANSACTION_ABORTED) {
        return true;
    }
    message_is_transaction_aborted(&err.to_string())
}

fn message_is_transaction_aborted(message: &str) -> bool {
    message.contains(SQLSTATE_TRANSACTION_ABORTED)
        || message.contains("current transaction is aborted")
}
