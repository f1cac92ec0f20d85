//! Domain types for the gs3d orchestrator.
//!
//! This module contains the core data structures:
//! - Artifact: Store-issued references and their kinds
//! - Stage: The fixed stage sequence and a job's position in it
//! - Job: Per-job state, snapshots and replay
//! - Events: Immutable records of state changes

pub mod artifact;
pub mod events;
pub mod job;
pub mod stage;

// Re-export commonly used types
pub use artifact::{ArtifactKind, ArtifactRef};
pub use events::{EventType, JobEvent};
pub use job::{Guard, Job, JobId, JobSnapshot, StageError, StageErrorKind, StageOutcome};
pub use stage::{Position, Stage};
