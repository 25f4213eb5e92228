//! Error types for vault operations.

use thiserror::Error;

use crate::errors::EngineError;

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, SecretsError>;

/// Errors raised by the secrets vault.
#[derive(Error, Debug)]
pub enum SecretsError {
    /// No credential stored under this id.
    #[error("Credential not found: {id}")]
    NotFound { id: String },

    /// `store` called for an id that already exists.
    #[error("Credential already exists: {id}")]
    Duplicate { id: String },

    /// Rotation did not verify; the previous record is unchanged.
    #[error("Rotation failed for credential '{id}': {reason}")]
    RotationFailed { id: String, reason: String },

    /// Plaintext or id rejected before encryption.
    #[error("Invalid credential value: {reason}")]
    InvalidValue { reason: String },

    /// Master secret missing or unusable.
    #[error("Master key error: {message}")]
    MasterKey { message: String },

    /// Seal or open failed (wrong key, tampered ciphertext, bad layout).
    #[error("Cryptographic operation failed: {message}")]
    Crypto { message: String },

    /// The audit entry for this operation could not be appended. Mutations
    /// already committed stay committed; reads withhold the value.
    #[error("Audit append failed for '{operation}': {message}")]
    Audit { operation: String, message: String },

    /// Store file could not be read or written.
    #[error("Credential store I/O failed: {0}")]
    Storage(#[from] std::io::Error),

    /// Store file could not be parsed or encoded.
    #[error("Credential store encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SecretsError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::Duplicate { id: id.into() }
    }

    pub fn rotation_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RotationFailed { id: id.into(), reason: reason.into() }
    }

    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue { reason: reason.into() }
    }

    pub fn master_key(message: impl Into<String>) -> Self {
        Self::MasterKey { message: message.into() }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto { message: message.into() }
    }

    pub fn audit(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Audit { operation: operation.into(), message: message.into() }
    }
}

impl From<SecretsError> for EngineError {
    fn from(error: SecretsError) -> Self {
        match error {
            SecretsError::NotFound { id } => EngineError::not_found("credential", id),
            SecretsError::Duplicate { id } => EngineError::duplicate("credential", id),
            SecretsError::RotationFailed { id, reason } => EngineError::RotationFailed { id, reason },
            SecretsError::InvalidValue { reason } => EngineError::validation(reason),
            SecretsError::MasterKey { message } => EngineError::config(message),
            SecretsError::Crypto { message } => EngineError::internal(message),
            SecretsError::Audit { operation, message } => {
                EngineError::internal(format!("Audit append failed for '{}': {}", operation, message))
            }
            SecretsError::Storage(source) => EngineError::io(source, "Credential store I/O failed"),
            SecretsError::Serialization(source) => EngineError::Serialization {
                source,
                context: "Credential store encoding failed".to_string(),
            },
        }
    }
}
