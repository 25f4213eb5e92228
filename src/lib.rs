//! # Driftwatch
//!
//! Infrastructure state reconciliation and deployment orchestration engine.
//! Driftwatch keeps a versioned baseline of the desired configuration of
//! every managed resource, scans live state for drift, routes drift by
//! severity, and applies changes through a staged, approval-gated pipeline
//! with backups and rollback.
//!
//! ## Architecture
//!
//! ```text
//!                   ┌──────────────┐
//!  ScanScheduler ─▶ │    Engine    │ ◀─ request_deploy / approve / rollback
//!                   └──────┬───────┘
//!        ┌─────────────────┼──────────────────────┐
//!        ▼                 ▼                      ▼
//!  DriftDetector ─▶ RemediationDispatcher   WorkflowOrchestrator ─▶ RollbackManager
//!        │                 │                      │
//!        ▼                 ▼                      ▼
//!  StateCollector ──▶ ResourceClient ◀──── (apply / verify)
//!        │
//!  BaselineStore          SecretsVault          AuditLog
//! ```
//!
//! Scans, deployment runs, automatic fixes and rollbacks for one resource
//! never interleave: they share [`locks::ResourceLocks`].
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let engine = Engine::from_config(&config, client, baselines, vault, audit, alerts)?;
//!
//! let revision = engine.adopt("vm-42", "alice").await?;
//! let run = engine.request_deploy("vm-42", revision, Environment::Dev, "alice").await?;
//! let outcome = engine.request_scan(&["vm-42".to_string()]).await;
//! ```

pub mod adapter;
pub mod alerts;
pub mod audit;
pub mod baseline;
pub mod collector;
pub mod config;
pub mod drift;
pub mod engine;
pub mod errors;
pub mod locks;
pub mod observability;
pub mod remediation;
pub mod rollback;
pub mod scheduler;
pub mod secrets;
pub mod storage;
pub mod workflow;

// Re-export commonly used types and traits
pub use config::AppConfig;
pub use engine::{Engine, ScanOutcome};
pub use errors::{EngineError, ErrorKind, Result};
pub use scheduler::ScanScheduler;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
