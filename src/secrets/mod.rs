//! # Secrets Vault
//!
//! Encrypted storage for the operational credentials used to reach the
//! infrastructure provider.
//!
//! - Values are sealed with AES-256-GCM under a key derived from the master
//!   secret with PBKDF2-HMAC-SHA256 and a per-record random salt.
//! - `store` never overwrites; replacing a value goes through `rotate`, which
//!   verifies the new ciphertext before swapping it in.
//! - Every operation appends an entry to the audit log. Plaintext never
//!   reaches logs, audit entries or the store file.
//!
//! ```rust,ignore
//! use driftwatch::secrets::{CredentialCipher, SecretsVault, SecretString};
//!
//! let cipher = CredentialCipher::new(SecretString::new(master), 210_000)?;
//! let vault = SecretsVault::new(cipher, audit, chrono::Duration::days(90));
//!
//! vault.store("provider-api-token", "tok-123").await?;
//! let token = vault.retrieve("provider-api-token").await?;
//! vault.rotate("provider-api-token", "tok-456").await?;
//! ```

pub mod encryption;
pub mod error;
pub mod types;
pub mod vault;

pub use encryption::{CredentialCipher, MIN_PBKDF2_ITERATIONS};
pub use error::SecretsError;
pub use types::{CredentialMetadata, CredentialRecord, SecretString};
pub use vault::SecretsVault;
