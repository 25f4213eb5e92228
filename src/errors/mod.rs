//! # Error Handling
//!
//! Crate-wide error taxonomy for the reconciliation engine. Subsystems with
//! their own error enums (`secrets`, `adapter`) convert into [`EngineError`].

pub mod types;

pub use types::{EngineError, ErrorKind, Result};
