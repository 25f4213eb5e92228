//! # Audit Log
//!
//! Append-only, hash-chained audit trail for vault operations and deployment
//! stage transitions.
//!
//! Each entry stores the hash of its predecessor and its own
//! `sha256(prev_hash || canonical entry)`, so editing, dropping or reordering
//! entries breaks [`verify_chain`]. Entries never contain plaintext secrets;
//! the optional `detail` field carries operator-level error detail that is
//! kept out of alert channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{EngineError, Result};

/// `prev_hash` of the first entry in a chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// Event to be recorded; sequencing and hashing are added by [`AuditLog`].
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor: String,
    pub operation: String,
    pub subject_id: String,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn success(
        actor: impl Into<String>,
        operation: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            operation: operation.into(),
            subject_id: subject_id.into(),
            outcome: AuditOutcome::Success,
            detail: None,
        }
    }

    pub fn failure(
        actor: impl Into<String>,
        operation: impl Into<String>,
        subject_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            operation: operation.into(),
            subject_id: subject_id.into(),
            outcome: AuditOutcome::Failure,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A sealed audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub operation: String,
    pub subject_id: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    sequence: u64,
    timestamp: String,
    actor: &'a str,
    operation: &'a str,
    subject_id: &'a str,
    outcome: AuditOutcome,
    detail: Option<&'a str>,
}

impl AuditEntry {
    fn seal(sequence: u64, timestamp: DateTime<Utc>, event: AuditEvent, prev_hash: String) -> Self {
        let mut entry = Self {
            sequence,
            timestamp,
            actor: event.actor,
            operation: event.operation,
            subject_id: event.subject_id,
            outcome: event.outcome,
            detail: event.detail,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// Recompute this entry's hash from its content and `prev_hash`
    pub fn compute_hash(&self) -> String {
        let canonical = CanonicalEntry {
            sequence: self.sequence,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            actor: &self.actor,
            operation: &self.operation,
            subject_id: &self.subject_id,
            outcome: self.outcome,
            detail: self.detail.as_deref(),
        };
        // Serialising a plain struct of strings and integers cannot fail
        let body = serde_json::to_vec(&canonical).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

/// Where a chain is broken
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainViolation {
    #[error("entry {sequence}: expected sequence {expected}")]
    SequenceGap { sequence: u64, expected: u64 },
    #[error("entry {sequence}: prev_hash does not match predecessor")]
    BrokenLink { sequence: u64 },
    #[error("entry {sequence}: content hash mismatch")]
    HashMismatch { sequence: u64 },
}

/// Verify a complete chain starting at sequence 1.
pub fn verify_chain(entries: &[AuditEntry]) -> std::result::Result<(), ChainViolation> {
    let mut prev_hash = GENESIS_HASH;
    for (index, entry) in entries.iter().enumerate() {
        let expected = index as u64 + 1;
        if entry.sequence != expected {
            return Err(ChainViolation::SequenceGap { sequence: entry.sequence, expected });
        }
        if entry.prev_hash != prev_hash {
            return Err(ChainViolation::BrokenLink { sequence: entry.sequence });
        }
        if entry.compute_hash() != entry.hash {
            return Err(ChainViolation::HashMismatch { sequence: entry.sequence });
        }
        prev_hash = &entry.hash;
    }
    Ok(())
}

/// Storage for sealed entries
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// All entries in append order
    async fn entries(&self) -> Result<Vec<AuditEntry>>;
}

/// In-memory sink for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.lock().await.clone())
    }
}

/// JSON-lines file sink. One entry per line, opened in append mode.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::io(e, format!("Failed to create audit directory {}", parent.display()))
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                EngineError::io(e, format!("Failed to open audit log {}", self.path.display()))
            })?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::io(
                    e,
                    format!("Failed to read audit log {}", self.path.display()),
                ))
            }
        };

        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(EngineError::from))
            .collect()
    }
}

struct ChainHead {
    sequence: u64,
    hash: String,
}

/// Hash-chained audit log over a pluggable sink.
///
/// A failed append leaves the chain head where it was and is returned to
/// the caller, which must not report the audited operation as done.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    head: Arc<Mutex<ChainHead>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Ephemeral in-memory log
    pub fn in_memory() -> Self {
        Self {
            sink: Arc::new(MemoryAuditSink::new()),
            head: Arc::new(Mutex::new(ChainHead { sequence: 0, hash: GENESIS_HASH.to_string() })),
        }
    }

    /// Open a log over an existing sink, resuming its chain
    pub async fn open(sink: Arc<dyn AuditSink>) -> Result<Self> {
        let existing = sink.entries().await?;
        let head = match existing.last() {
            Some(last) => ChainHead { sequence: last.sequence, hash: last.hash.clone() },
            None => ChainHead { sequence: 0, hash: GENESIS_HASH.to_string() },
        };

        tracing::debug!(entries = existing.len(), "Audit log opened");
        Ok(Self { sink, head: Arc::new(Mutex::new(head)) })
    }

    /// Seal and append an event
    pub async fn record(&self, event: AuditEvent) -> Result<()> {
        let mut head = self.head.lock().await;
        let entry = AuditEntry::seal(head.sequence + 1, Utc::now(), event, head.hash.clone());

        match self.sink.append(&entry).await {
            Ok(()) => {
                head.sequence = entry.sequence;
                head.hash = entry.hash;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    operation = %entry.operation,
                    subject_id = %entry.subject_id,
                    "Failed to record audit entry"
                );
                Err(e)
            }
        }
    }

    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.sink.entries().await
    }

    /// Entries for one credential or resource
    pub async fn entries_for(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self.entries().await?.into_iter().filter(|e| e.subject_id == subject_id).collect())
    }

    /// Verify the stored chain end to end
    pub async fn verify(&self) -> Result<()> {
        let entries = self.entries().await?;
        verify_chain(&entries)
            .map_err(|violation| EngineError::internal(format!("Audit chain broken: {}", violation)))
    }
}
