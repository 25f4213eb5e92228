//! # Error Types
//!
//! Error types for the engine using `thiserror`. Every variant maps onto an
//! [`ErrorKind`] so that operator-facing channels (alerts) can report the
//! taxonomy kind without exposing source chains.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Custom result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the engine
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Network or timeout failure against an external collaborator
    #[error("Transient failure for '{resource_id}': {message}")]
    Transient { resource_id: String, message: String },

    /// Malformed or forbidden configuration, caught before any mutation
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Credential missing, invalid or rejected by the provider
    #[error("Authorization error: {message}")]
    Authorization { message: String },

    /// Concurrent mutation detected
    #[error("Conflict on '{resource_id}': {message}")]
    Conflict { resource_id: String, message: String },

    /// Residual drift after apply or rollback
    #[error("Consistency error on '{resource_id}': {differences} residual difference(s)")]
    Consistency { resource_id: String, differences: usize },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Resource already exists
    #[error("Duplicate {resource_type}: '{id}' already exists")]
    Duplicate { resource_type: String, id: String },

    /// Credential rotation did not verify; the old record is untouched
    #[error("Rotation failed for credential '{id}': {reason}")]
    RotationFailed { id: String, reason: String },

    /// Live state could not be collected after all retry attempts
    #[error("Collection failed for '{resource_id}' after {attempts} attempt(s): {message}")]
    CollectionFailed { resource_id: String, attempts: u32, message: String },

    /// Deployment run state machine rejected a transition
    #[error("Invalid transition for run '{run_id}': {from} -> {to}")]
    InvalidTransition { run_id: String, from: String, to: String },

    /// Timeout errors
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Taxonomy kind reported to alert channels and the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    Authorization,
    Conflict,
    Consistency,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Consistency => "consistency",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    /// Create a transient error
    pub fn transient<R: Into<String>, M: Into<String>>(resource_id: R, message: M) -> Self {
        Self::Transient { resource_id: resource_id.into(), message: message.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an authorization error
    pub fn authorization<S: Into<String>>(message: S) -> Self {
        Self::Authorization { message: message.into() }
    }

    /// Create a conflict error
    pub fn conflict<R: Into<String>, M: Into<String>>(resource_id: R, message: M) -> Self {
        Self::Conflict { resource_id: resource_id.into(), message: message.into() }
    }

    /// Create a consistency error
    pub fn consistency<R: Into<String>>(resource_id: R, differences: usize) -> Self {
        Self::Consistency { resource_id: resource_id.into(), differences }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a duplicate error
    pub fn duplicate<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::Duplicate { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create an invalid transition error
    pub fn invalid_transition<R, F, T>(run_id: R, from: F, to: T) -> Self
    where
        R: Into<String>,
        F: fmt::Display,
        T: fmt::Display,
    {
        Self::InvalidTransition { run_id: run_id.into(), from: from.to_string(), to: to.to_string() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create a database error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database { source, context: context.into() }
    }

    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transient { .. }
            | EngineError::Timeout { .. }
            | EngineError::CollectionFailed { .. } => ErrorKind::Transient,
            EngineError::Validation { .. }
            | EngineError::Duplicate { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::Config { .. }
            | EngineError::Serialization { .. } => ErrorKind::Validation,
            EngineError::Authorization { .. } => ErrorKind::Authorization,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::Consistency { .. } => ErrorKind::Consistency,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::RotationFailed { .. }
            | EngineError::Database { .. }
            | EngineError::Io { .. }
            | EngineError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error should be retried.
    ///
    /// Only the collector retries; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient { .. } | EngineError::Timeout { .. })
    }

    /// Operator-facing summary without source chains.
    pub fn summary(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database { source: error, context: "Database operation failed".to_string() }
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::Database {
            source: sqlx::Error::Migrate(Box::new(error)),
            context: "Database migration failed".to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::config_with_source("YAML parsing failed", Box::new(error))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}
