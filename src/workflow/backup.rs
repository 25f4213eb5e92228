//! Pre-apply backups of live state, referenced from deployment runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::adapter::ConfigMap;
use crate::errors::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub backup_ref: String,
    pub resource_id: String,
    pub run_id: String,
    pub config: ConfigMap,
    pub captured_at: DateTime<Utc>,
}

/// Backups are immutable once stored
#[derive(Debug, Clone, Default)]
pub struct BackupStore {
    backups: Arc<DashMap<String, Backup>>,
}

impl BackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `config` as the pre-apply state of `run_id` and return its reference
    pub fn put(&self, resource_id: &str, run_id: &str, config: ConfigMap) -> String {
        let backup_ref = format!("bkp-{}", uuid::Uuid::new_v4());
        self.backups.insert(
            backup_ref.clone(),
            Backup {
                backup_ref: backup_ref.clone(),
                resource_id: resource_id.to_string(),
                run_id: run_id.to_string(),
                config,
                captured_at: Utc::now(),
            },
        );
        backup_ref
    }

    pub fn get(&self, backup_ref: &str) -> Result<Backup> {
        self.backups
            .get(backup_ref)
            .map(|b| b.clone())
            .ok_or_else(|| EngineError::not_found("backup", backup_ref))
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }
}
