//! Encrypted credential vault.
//!
//! Records live in memory and, when a store path is configured, are written
//! through to a JSON file after every mutation (temp file + rename). Every
//! operation on an id is serialised by that id's lock; unrelated ids do not
//! contend. Every operation appends an audit entry, and an operation whose
//! entry cannot be appended reports `SecretsError::Audit`.
//!
//! Key derivation and AEAD work run on the blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn, Span};

use super::encryption::{CredentialCipher, SealedSecret};
use super::error::{Result, SecretsError};
use super::types::{CredentialMetadata, CredentialRecord, SecretString};
use crate::audit::{AuditEvent, AuditLog};
use crate::config::VaultSettings;
use crate::locks::ResourceLocks;
use crate::observability::MetricsRecorder;

const ACTOR: &str = "vault";

/// Encrypted credential store with per-id mutual exclusion.
pub struct SecretsVault {
    cipher: Arc<CredentialCipher>,
    records: DashMap<String, CredentialRecord>,
    locks: ResourceLocks,
    store_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
    rotation_period: chrono::Duration,
    audit: AuditLog,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for SecretsVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsVault")
            .field("records", &self.records.len())
            .field("store_path", &self.store_path)
            .finish()
    }
}

impl SecretsVault {
    /// In-memory vault
    pub fn new(cipher: CredentialCipher, audit: AuditLog, rotation_period: chrono::Duration) -> Self {
        Self {
            cipher: Arc::new(cipher),
            records: DashMap::new(),
            locks: ResourceLocks::new(),
            store_path: None,
            persist_lock: Mutex::new(()),
            rotation_period,
            audit,
            metrics: MetricsRecorder::new(),
        }
    }

    /// Open a file-backed vault, loading any existing records
    pub async fn open(
        cipher: CredentialCipher,
        audit: AuditLog,
        rotation_period: chrono::Duration,
        store_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let store_path = store_path.into();
        let mut vault = Self::new(cipher, audit, rotation_period);

        match tokio::fs::read_to_string(&store_path).await {
            Ok(raw) => {
                let records: Vec<CredentialRecord> = serde_json::from_str(&raw)?;
                for record in records {
                    vault.records.insert(record.id.clone(), record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            path = %store_path.display(),
            credentials = vault.records.len(),
            "Credential store opened"
        );
        vault.store_path = Some(store_path);
        Ok(vault)
    }

    /// Build a vault from configuration, reading the master secret from the
    /// configured environment variable
    pub async fn from_settings(settings: &VaultSettings, audit: AuditLog) -> Result<Self> {
        let cipher =
            CredentialCipher::from_env(&settings.master_key_env, settings.pbkdf2_iterations)?;
        match &settings.store_path {
            Some(path) => Self::open(cipher, audit, settings.rotation_period(), path).await,
            None => Ok(Self::new(cipher, audit, settings.rotation_period())),
        }
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    /// Ids with a live lock slot; slots go away once an id is idle
    pub fn tracked_locks(&self) -> usize {
        self.locks.tracked()
    }

    fn associated_data(id: &str, key_id: &str) -> String {
        format!("{}#{}", id, key_id)
    }

    fn validate(id: &str, plaintext: &SecretString) -> Result<()> {
        if id.trim().is_empty() {
            return Err(SecretsError::invalid_value("Credential id cannot be empty"));
        }
        if plaintext.is_empty() {
            return Err(SecretsError::invalid_value("Credential value cannot be empty"));
        }
        Ok(())
    }

    async fn seal(&self, associated: String, plaintext: SecretString) -> Result<SealedSecret> {
        let cipher = Arc::clone(&self.cipher);
        let span = Span::current();
        tokio::task::spawn_blocking(move || span.in_scope(|| cipher.seal(&associated, &plaintext)))
            .await
            .map_err(|e| SecretsError::crypto(format!("Sealing task failed: {}", e)))?
    }

    async fn open_sealed(
        &self,
        associated: String,
        ciphertext: Vec<u8>,
        salt: Vec<u8>,
    ) -> Result<SecretString> {
        let cipher = Arc::clone(&self.cipher);
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            span.in_scope(|| cipher.open(&associated, &ciphertext, &salt))
        })
        .await
        .map_err(|e| SecretsError::crypto(format!("Opening task failed: {}", e)))?
    }

    /// Write the current records with `change` applied, then commit `change`
    /// in memory. Holding `persist_lock` across both keeps file and memory in
    /// the same order.
    async fn persist_and_commit(&self, id: &str, change: Option<CredentialRecord>) -> Result<()> {
        let _guard = self.persist_lock.lock().await;

        if let Some(path) = &self.store_path {
            let mut snapshot: BTreeMap<String, CredentialRecord> = self
                .records
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            match &change {
                Some(record) => snapshot.insert(id.to_string(), record.clone()),
                None => snapshot.remove(id),
            };
            let records: Vec<CredentialRecord> = snapshot.into_values().collect();
            write_atomically(path, &serde_json::to_vec_pretty(&records)?).await?;
        }

        match change {
            Some(record) => {
                self.records.insert(id.to_string(), record);
            }
            None => {
                self.records.remove(id);
            }
        }
        Ok(())
    }

    /// Append the audit entry for `result` and fold an append failure into
    /// it. The operation's own error wins over the audit error.
    async fn audited<T>(&self, operation: &str, id: &str, result: Result<T>) -> Result<T> {
        let event = match &result {
            Ok(_) => AuditEvent::success(ACTOR, operation, id),
            Err(e) => AuditEvent::failure(ACTOR, operation, id, e.to_string()),
        };
        self.metrics.record_vault_operation(operation, result.is_ok());

        let appended = self.audit.record(event).await;
        let value = result?;
        appended.map_err(|e| SecretsError::audit(operation, e.to_string()))?;
        Ok(value)
    }

    /// Encrypt and store a new credential. Fails with `Duplicate` if `id`
    /// exists; use [`SecretsVault::rotate`] to replace a value.
    #[instrument(skip_all, fields(credential_id = %id))]
    pub async fn store(&self, id: &str, plaintext: impl Into<SecretString>) -> Result<()> {
        let plaintext = plaintext.into();
        let _guard = self.locks.acquire(id).await;

        let result = self.store_locked(id, plaintext).await;
        let result = self.audited("vault.store", id, result).await;
        if result.is_ok() {
            info!(credential_id = %id, "Credential stored");
        }
        result
    }

    async fn store_locked(&self, id: &str, plaintext: SecretString) -> Result<()> {
        Self::validate(id, &plaintext)?;
        if self.records.contains_key(id) {
            return Err(SecretsError::duplicate(id));
        }

        let key_id = uuid::Uuid::new_v4().to_string();
        let sealed = self.seal(Self::associated_data(id, &key_id), plaintext).await?;
        let now = Utc::now();
        let record = CredentialRecord {
            id: id.to_string(),
            ciphertext: sealed.ciphertext,
            key_derivation_salt: sealed.salt,
            created_at: now,
            rotation_due: now + self.rotation_period,
            generation: 1,
            key_id,
            rotated_at: None,
        };

        self.persist_and_commit(id, Some(record)).await
    }

    /// Decrypt a credential. The plaintext is never logged, and is withheld
    /// when the read cannot be audited.
    #[instrument(skip_all, fields(credential_id = %id))]
    pub async fn retrieve(&self, id: &str) -> Result<SecretString> {
        let _guard = self.locks.acquire(id).await;

        let result = match self.records.get(id).map(|entry| entry.value().clone()) {
            Some(record) => {
                self.open_sealed(
                    Self::associated_data(&record.id, &record.key_id),
                    record.ciphertext,
                    record.key_derivation_salt,
                )
                .await
            }
            None => Err(SecretsError::not_found(id)),
        };
        self.audited("vault.retrieve", id, result).await
    }

    /// Replace a credential's value.
    ///
    /// The new ciphertext must decrypt back to `new_plaintext` and be written
    /// to the store before the old record is replaced; otherwise the old record
    /// is left untouched and `RotationFailed` is returned.
    #[instrument(skip_all, fields(credential_id = %id))]
    pub async fn rotate(&self, id: &str, new_plaintext: impl Into<SecretString>) -> Result<()> {
        let new_plaintext = new_plaintext.into();
        let _guard = self.locks.acquire(id).await;

        let result = self.rotate_locked(id, new_plaintext).await;
        let result = self.audited("vault.rotate", id, result).await;
        match &result {
            Ok(()) => info!(credential_id = %id, "Credential rotated"),
            Err(e) => warn!(credential_id = %id, error = %e, "Credential rotation failed"),
        }
        result
    }

    async fn rotate_locked(&self, id: &str, new_plaintext: SecretString) -> Result<()> {
        Self::validate(id, &new_plaintext)?;
        let current = self
            .records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SecretsError::not_found(id))?;

        let key_id = uuid::Uuid::new_v4().to_string();
        let associated = Self::associated_data(id, &key_id);
        let sealed = self.seal(associated.clone(), new_plaintext.clone()).await?;

        let round_trip = self
            .open_sealed(associated, sealed.ciphertext.clone(), sealed.salt.clone())
            .await
            .map_err(|e| SecretsError::rotation_failed(id, format!("verification failed: {}", e)))?;
        if round_trip != new_plaintext {
            return Err(SecretsError::rotation_failed(id, "round-trip value mismatch"));
        }

        let now = Utc::now();
        let replacement = CredentialRecord {
            id: id.to_string(),
            ciphertext: sealed.ciphertext,
            key_derivation_salt: sealed.salt,
            created_at: current.created_at,
            rotation_due: now + self.rotation_period,
            generation: current.generation.wrapping_add(1).max(1),
            key_id,
            rotated_at: Some(now),
        };

        self.persist_and_commit(id, Some(replacement))
            .await
            .map_err(|e| SecretsError::rotation_failed(id, format!("store write failed: {}", e)))
    }

    /// Remove a credential. Synchronous and irreversible.
    #[instrument(skip_all, fields(credential_id = %id))]
    pub async fn revoke(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;

        let result = if self.records.contains_key(id) {
            self.persist_and_commit(id, None).await
        } else {
            Err(SecretsError::not_found(id))
        };
        let result = self.audited("vault.revoke", id, result).await;
        if result.is_ok() {
            info!(credential_id = %id, "Credential revoked");
        }
        result
    }

    /// Metadata for every stored credential, ordered by id
    pub fn list(&self) -> Vec<CredentialMetadata> {
        let mut items: Vec<CredentialMetadata> =
            self.records.iter().map(|entry| entry.value().metadata()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// Ids whose rotation is due at `now`
    pub fn due_for_rotation(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.value().rotation_due <= now)
            .map(|entry| entry.key().clone())
            .collect();
        due.sort();
        due
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Copy of the stored record (ciphertext only)
    pub fn record(&self, id: &str) -> Option<CredentialRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    /// Try to decrypt `ciphertext` as the record currently stored under `id`.
    ///
    /// Ciphertexts sealed for any earlier record of the same id never open here.
    pub async fn open_as_current(
        &self,
        id: &str,
        ciphertext: &[u8],
        salt: &[u8],
    ) -> Result<SecretString> {
        let key_id = self
            .records
            .get(id)
            .map(|entry| entry.value().key_id.clone())
            .ok_or_else(|| SecretsError::not_found(id))?;
        self.open_sealed(Self::associated_data(id, &key_id), ciphertext.to_vec(), salt.to_vec())
            .await
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::encryption::MIN_PBKDF2_ITERATIONS;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(SecretString::new("unit-test-master"), MIN_PBKDF2_ITERATIONS).unwrap()
    }

    fn vault() -> SecretsVault {
        SecretsVault::new(cipher(), AuditLog::in_memory(), chrono::Duration::days(90))
    }

    #[tokio::test]
    async fn test_store_retrieve_round_trip() {
        let vault = vault();
        vault.store("db", "secret").await.unwrap();

        assert_eq!(vault.retrieve("db").await.unwrap().expose_secret(), "secret");
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate() {
        let vault = vault();
        vault.store("db", "one").await.unwrap();

        let err = vault.store("db", "two").await.unwrap_err();
        assert!(matches!(err, SecretsError::Duplicate { .. }));
        assert_eq!(vault.retrieve("db").await.unwrap().expose_secret(), "one");
    }

    #[tokio::test]
    async fn test_store_rejects_empty_value() {
        let vault = vault();
        assert!(matches!(
            vault.store("db", "").await,
            Err(SecretsError::InvalidValue { .. })
        ));
        assert!(!vault.contains("db"));
    }

    #[tokio::test]
    async fn test_retrieve_missing() {
        let vault = vault();
        assert!(matches!(vault.retrieve("nope").await, Err(SecretsError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_rotate_replaces_value_and_invalidates_old_ciphertext() {
        let vault = vault();
        vault.store("db", "old").await.unwrap();
        let old = vault.record("db").unwrap();

        vault.rotate("db", "new").await.unwrap();

        assert_eq!(vault.retrieve("db").await.unwrap().expose_secret(), "new");
        let current = vault.record("db").unwrap();
        assert_eq!(current.generation, 2);
        assert_eq!(current.created_at, old.created_at);
        assert!(current.rotated_at.is_some());
        assert_ne!(current.key_id, old.key_id);
        assert!(vault
            .open_as_current("db", &old.ciphertext, &old.key_derivation_salt)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rotate_missing_credential() {
        let vault = vault();
        assert!(matches!(vault.rotate("db", "x").await, Err(SecretsError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_revoke_is_irreversible() {
        let vault = vault();
        vault.store("db", "secret").await.unwrap();
        vault.revoke("db").await.unwrap();

        assert!(matches!(vault.retrieve("db").await, Err(SecretsError::NotFound { .. })));
        assert!(matches!(vault.revoke("db").await, Err(SecretsError::NotFound { .. })));
        // The id can be provisioned again from scratch
        vault.store("db", "fresh").await.unwrap();
        assert_eq!(vault.record("db").unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_ciphertext_from_revoked_record_does_not_open_after_restore() {
        let vault = vault();
        vault.store("db", "first-life").await.unwrap();
        let revoked = vault.record("db").unwrap();
        vault.revoke("db").await.unwrap();

        vault.store("db", "second-life").await.unwrap();
        let current = vault.record("db").unwrap();
        assert_eq!(current.generation, revoked.generation);
        assert_ne!(current.key_id, revoked.key_id);

        assert!(vault
            .open_as_current("db", &revoked.ciphertext, &revoked.key_derivation_salt)
            .await
            .is_err());
        let opened = vault
            .open_as_current("db", &current.ciphertext, &current.key_derivation_salt)
            .await
            .unwrap();
        assert_eq!(opened.expose_secret(), "second-life");
    }

    #[tokio::test]
    async fn test_unauditable_operations_fail() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let audit = AuditLog::open(Arc::new(crate::audit::JsonlAuditSink::new(&log_path)))
            .await
            .unwrap();
        let vault = SecretsVault::new(cipher(), audit, chrono::Duration::days(90));
        vault.store("db", "secret").await.unwrap();

        std::fs::remove_file(&log_path).unwrap();
        std::fs::create_dir(&log_path).unwrap();

        let err = vault.retrieve("db").await.unwrap_err();
        assert!(matches!(err, SecretsError::Audit { .. }));
        assert!(matches!(vault.rotate("db", "next").await, Err(SecretsError::Audit { .. })));
        assert!(matches!(vault.revoke("db").await, Err(SecretsError::Audit { .. })));

        // The operation's own failure is reported ahead of the audit failure
        assert!(matches!(vault.retrieve("missing").await, Err(SecretsError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_idle_ids_release_their_lock_slots() {
        let vault = vault();
        for i in 0..20 {
            let id = format!("cred-{}", i);
            vault.store(&id, "v").await.unwrap();
            vault.retrieve(&id).await.unwrap();
        }
        vault.revoke("cred-0").await.unwrap();

        assert_eq!(vault.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_every_operation_is_audited() {
        let audit = AuditLog::in_memory();
        let vault = SecretsVault::new(cipher(), audit.clone(), chrono::Duration::days(90));

        vault.store("db", "secret").await.unwrap();
        vault.retrieve("db").await.unwrap();
        vault.rotate("db", "secret-2").await.unwrap();
        vault.revoke("db").await.unwrap();
        let _ = vault.retrieve("db").await;

        let entries = audit.entries().await.unwrap();
        let operations: Vec<&str> = entries.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(
            operations,
            vec!["vault.store", "vault.retrieve", "vault.rotate", "vault.revoke", "vault.retrieve"]
        );
        assert!(audit.verify().await.is_ok());

        let serialized = serde_json::to_string(&entries).unwrap();
        assert!(!serialized.contains("secret-2"));
    }

    #[tokio::test]
    async fn test_due_for_rotation() {
        let vault = SecretsVault::new(cipher(), AuditLog::in_memory(), chrono::Duration::days(30));
        vault.store("a", "1").await.unwrap();
        vault.store("b", "2").await.unwrap();

        assert!(vault.due_for_rotation(Utc::now()).is_empty());
        let later = Utc::now() + chrono::Duration::days(31);
        assert_eq!(vault.due_for_rotation(later), vec!["a".to_string(), "b".to_string()]);

        let listed: Vec<String> = vault.list().into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_file_backed_vault_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");

        let vault =
            SecretsVault::open(cipher(), AuditLog::in_memory(), chrono::Duration::days(90), &path)
                .await
                .unwrap();
        vault.store("db", "persisted").await.unwrap();
        drop(vault);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("persisted"));

        let reopened =
            SecretsVault::open(cipher(), AuditLog::in_memory(), chrono::Duration::days(90), &path)
                .await
                .unwrap();
        assert_eq!(reopened.retrieve("db").await.unwrap().expose_secret(), "persisted");
    }

    #[tokio::test]
    async fn test_failed_rotation_leaves_old_record() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        let path = store_dir.join("vault.json");

        let vault =
            SecretsVault::open(cipher(), AuditLog::in_memory(), chrono::Duration::days(90), &path)
                .await
                .unwrap();
        vault.store("db", "original").await.unwrap();
        let before = vault.record("db").unwrap();

        // Replace the store directory with a plain file so the write fails
        std::fs::remove_dir_all(&store_dir).unwrap();
        std::fs::write(&store_dir, b"not a directory").unwrap();

        let err = vault.rotate("db", "replacement").await.unwrap_err();
        assert!(matches!(err, SecretsError::RotationFailed { .. }));
        assert_eq!(vault.record("db").unwrap(), before);
        assert_eq!(vault.retrieve("db").await.unwrap().expose_secret(), "original");
    }

    #[tokio::test]
    async fn test_key_derivation_leaves_the_runtime_free() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let vault = vault();
        vault.store("db", "secret").await.unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let done = done.clone();
            let ticks = ticks.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        // Single-threaded runtime: the ticker only runs while retrieve waits
        for _ in 0..3 {
            vault.retrieve("db").await.unwrap();
        }
        done.store(true, Ordering::SeqCst);
        ticker.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) > 0);
    }
}
