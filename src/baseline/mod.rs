//! # Baseline Store
//!
//! Versioned desired state per resource, kept as an append-only log of
//! snapshots. The current baseline is the highest revision.
//!
//! Revision assignment is serialised per resource: `capture` holds that
//! resource's lock while it reads the latest revision and appends
//! `latest + 1`. Captures for different resources never contend.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument};

use crate::adapter::ConfigMap;
use crate::errors::{EngineError, Result};

/// How a snapshot came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Adopted from existing infrastructure or captured by an operator
    Manual,
    /// Recorded by a successful deployment
    Deploy,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Manual => "manual",
            SnapshotSource::Deploy => "deploy",
        }
    }
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SnapshotSource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(SnapshotSource::Manual),
            "deploy" => Ok(SnapshotSource::Deploy),
            other => Err(EngineError::validation(format!("Unknown snapshot source '{}'", other))),
        }
    }
}

/// One immutable baseline revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub resource_id: String,
    pub revision: u64,
    pub config: ConfigMap,
    pub captured_at: DateTime<Utc>,
    pub source: SnapshotSource,
}

/// Persistence for the snapshot log
#[async_trait]
pub trait BaselineRepository: Send + Sync {
    /// Highest-revision snapshot
    async fn latest(&self, resource_id: &str) -> Result<Option<Snapshot>>;

    async fn get(&self, resource_id: &str, revision: u64) -> Result<Option<Snapshot>>;

    /// Append a snapshot; `(resource_id, revision)` must be new
    async fn append(&self, snapshot: &Snapshot) -> Result<()>;

    /// Up to `limit` snapshots with `revision > after`, ascending
    async fn page(&self, resource_id: &str, after: u64, limit: usize) -> Result<Vec<Snapshot>>;
}

/// Map-backed repository for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct InMemoryBaselineRepository {
    snapshots: RwLock<HashMap<String, BTreeMap<u64, Snapshot>>>,
}

impl InMemoryBaselineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BaselineRepository for InMemoryBaselineRepository {
    async fn latest(&self, resource_id: &str) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(resource_id)
            .and_then(|log| log.values().next_back())
            .cloned())
    }

    async fn get(&self, resource_id: &str, revision: u64) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(resource_id).and_then(|log| log.get(&revision)).cloned())
    }

    async fn append(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        let log = snapshots.entry(snapshot.resource_id.clone()).or_default();
        if log.contains_key(&snapshot.revision) {
            return Err(EngineError::conflict(
                &snapshot.resource_id,
                format!("revision {} already exists", snapshot.revision),
            ));
        }
        log.insert(snapshot.revision, snapshot.clone());
        Ok(())
    }

    async fn page(&self, resource_id: &str, after: u64, limit: usize) -> Result<Vec<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(resource_id)
            .map(|log| {
                log.range(after.saturating_add(1)..).take(limit).map(|(_, s)| s.clone()).collect()
            })
            .unwrap_or_default())
    }
}

const DEFAULT_PAGE_SIZE: usize = 64;

/// Append-only baseline log with per-resource revision assignment
#[derive(Clone)]
pub struct BaselineStore {
    repository: Arc<dyn BaselineRepository>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    page_size: usize,
}

impl fmt::Debug for BaselineStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaselineStore").field("page_size", &self.page_size).finish()
    }
}

impl BaselineStore {
    pub fn new(repository: Arc<dyn BaselineRepository>) -> Self {
        Self { repository, locks: Arc::new(DashMap::new()), page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBaselineRepository::new()))
    }

    /// Page size used by [`BaselineStore::history`]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn resource_lock(&self, resource_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Record a new snapshot and return its revision (`current + 1`, from 1)
    #[instrument(skip_all, fields(resource_id = %resource_id, source = %source))]
    pub async fn capture(
        &self,
        resource_id: &str,
        config: ConfigMap,
        source: SnapshotSource,
    ) -> Result<u64> {
        if resource_id.trim().is_empty() {
            return Err(EngineError::validation_field("Resource id cannot be empty", "resource_id"));
        }

        let lock = self.resource_lock(resource_id);
        let _guard = lock.lock().await;

        let revision = self
            .repository
            .latest(resource_id)
            .await?
            .map(|snapshot| snapshot.revision + 1)
            .unwrap_or(1);

        let snapshot = Snapshot {
            resource_id: resource_id.to_string(),
            revision,
            config,
            captured_at: Utc::now(),
            source,
        };
        self.repository.append(&snapshot).await?;

        info!(resource_id = %resource_id, revision, source = %source, "Baseline captured");
        Ok(revision)
    }

    /// Current baseline or `NotFound`
    pub async fn current(&self, resource_id: &str) -> Result<Snapshot> {
        self.latest(resource_id)
            .await?
            .ok_or_else(|| EngineError::not_found("baseline", resource_id))
    }

    /// Current baseline, if any
    pub async fn latest(&self, resource_id: &str) -> Result<Option<Snapshot>> {
        self.repository.latest(resource_id).await
    }

    /// A specific revision or `NotFound`
    pub async fn get(&self, resource_id: &str, revision: u64) -> Result<Snapshot> {
        self.repository.get(resource_id, revision).await?.ok_or_else(|| {
            EngineError::not_found("baseline revision", format!("{}@{}", resource_id, revision))
        })
    }

    /// Every snapshot for a resource in ascending revision order.
    ///
    /// The stream is lazy (one page fetched at a time) and finite; calling
    /// `history` again restarts from revision 1.
    pub fn history<'a>(&'a self, resource_id: &'a str) -> impl Stream<Item = Result<Snapshot>> + 'a {
        self.history_from(resource_id, 0)
    }

    /// Snapshots with `revision > after`, ascending
    pub fn history_from<'a>(
        &'a self,
        resource_id: &'a str,
        after: u64,
    ) -> impl Stream<Item = Result<Snapshot>> + 'a {
        async_stream::try_stream! {
            let mut cursor = after;
            loop {
                let page = self.repository.page(resource_id, cursor, self.page_size).await?;
                let exhausted = page.len() < self.page_size;
                for snapshot in page {
                    cursor = snapshot.revision;
                    yield snapshot;
                }
                if exhausted {
                    break;
                }
            }
        }
    }
}
