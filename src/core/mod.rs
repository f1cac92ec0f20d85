//! Core orchestration logic.
//!
//! This module contains:
//! - JobJournal: Append-only per-job event log
//! - JobRegistry: Authoritative job state with compare-and-swap commits
//! - Orchestrator: The per-job stage state machine
//! - Driver: Caller-side retry loop on top of the orchestrator

pub mod driver;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod registry;

// Re-export commonly used types
pub use driver::{drive, RetryPolicy};
pub use error::{ErrorCategory, OrchestratorError};
pub use journal::{JobJournal, StageLock};
pub use orchestrator::Orchestrator;
pub use registry::JobRegistry;
