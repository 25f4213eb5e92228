//! # Storage and Persistence
//!
//! SQLite connectivity and the persistent baseline snapshot log.

pub mod baseline;
pub mod pool;

pub use crate::config::DatabaseConfig;
pub use baseline::SqliteBaselineRepository;
pub use pool::{check_connection, create_pool, run_migrations, DbPool};
