//! SQLite-backed baseline snapshot log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;

use crate::adapter::ConfigMap;
use crate::baseline::{BaselineRepository, Snapshot};
use crate::errors::{EngineError, Result};
use crate::storage::DbPool;

#[derive(Debug, FromRow)]
struct SnapshotRow {
    resource_id: String,
    revision: i64,
    config: String,
    source: String,
    captured_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = EngineError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        let config: ConfigMap = serde_json::from_str(&row.config).map_err(|e| {
            EngineError::Serialization {
                source: e,
                context: format!(
                    "Corrupt baseline config for {}@{}",
                    row.resource_id, row.revision
                ),
            }
        })?;

        Ok(Snapshot {
            revision: u64::try_from(row.revision).map_err(|_| {
                EngineError::internal(format!("Negative revision for {}", row.resource_id))
            })?,
            resource_id: row.resource_id,
            config,
            captured_at: row.captured_at,
            source: row.source.parse()?,
        })
    }
}

fn to_i64(revision: u64) -> Result<i64> {
    i64::try_from(revision)
        .map_err(|_| EngineError::validation(format!("Revision {} out of range", revision)))
}

/// `baseline_snapshots` table repository
#[derive(Debug, Clone)]
pub struct SqliteBaselineRepository {
    pool: DbPool,
}

impl SqliteBaselineRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BaselineRepository for SqliteBaselineRepository {
    #[instrument(skip(self), name = "db_latest_snapshot")]
    async fn latest(&self, resource_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT resource_id, revision, config, source, captured_at
             FROM baseline_snapshots
             WHERE resource_id = $1
             ORDER BY revision DESC
             LIMIT 1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::database(e, format!("Failed to load baseline for '{}'", resource_id))
        })?;

        row.map(Snapshot::try_from).transpose()
    }

    #[instrument(skip(self), name = "db_get_snapshot")]
    async fn get(&self, resource_id: &str, revision: u64) -> Result<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT resource_id, revision, config, source, captured_at
             FROM baseline_snapshots
             WHERE resource_id = $1 AND revision = $2",
        )
        .bind(resource_id)
        .bind(to_i64(revision)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::database(
                e,
                format!("Failed to load baseline {}@{}", resource_id, revision),
            )
        })?;

        row.map(Snapshot::try_from).transpose()
    }

    #[instrument(
        skip(self, snapshot),
        fields(resource_id = %snapshot.resource_id, revision = snapshot.revision),
        name = "db_append_snapshot"
    )]
    async fn append(&self, snapshot: &Snapshot) -> Result<()> {
        let config = serde_json::to_string(&snapshot.config)?;

        let result = sqlx::query(
            "INSERT INTO baseline_snapshots (resource_id, revision, config, source, captured_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&snapshot.resource_id)
        .bind(to_i64(snapshot.revision)?)
        .bind(config)
        .bind(snapshot.source.as_str())
        .bind(snapshot.captured_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EngineError::conflict(
                    &snapshot.resource_id,
                    format!("revision {} already exists", snapshot.revision),
                ))
            }
            Err(e) => Err(EngineError::database(
                e,
                format!(
                    "Failed to append baseline {}@{}",
                    snapshot.resource_id, snapshot.revision
                ),
            )),
        }
    }

    #[instrument(skip(self), name = "db_page_snapshots")]
    async fn page(&self, resource_id: &str, after: u64, limit: usize) -> Result<Vec<Snapshot>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT resource_id, revision, config, source, captured_at
             FROM baseline_snapshots
             WHERE resource_id = $1 AND revision > $2
             ORDER BY revision ASC
             LIMIT $3",
        )
        .bind(resource_id)
        .bind(to_i64(after)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            EngineError::database(e, format!("Failed to page baselines for '{}'", resource_id))
        })?;

        rows.into_iter().map(Snapshot::try_from).collect()
    }
}
