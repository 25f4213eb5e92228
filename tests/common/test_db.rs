//! Throwaway file-backed SQLite databases for integration tests.

#![allow(clippy::duplicate_mod)]

use driftwatch::config::DatabaseConfig;
use driftwatch::storage::{create_pool, DbPool};
use tempfile::TempDir;

/// A migrated database removed together with its directory on drop
pub struct TestDatabase {
    pub pool: DbPool,
    pub url: String,
    _dir: TempDir,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("driftwatch.db").display());
        let pool = connect(&url).await;
        Self { pool, url, _dir: dir }
    }

    /// A second, independent pool on the same file
    pub async fn reopen(&self) -> DbPool {
        connect(&self.url).await
    }
}

async fn connect(url: &str) -> DbPool {
    let config = DatabaseConfig { url: url.to_string(), ..Default::default() };
    create_pool(&config).await.expect("pool")
}
