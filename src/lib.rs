//! gs3d - Video to stylized 3D scene job orchestrator
//!
//! Turns an uploaded video into a stylized 3D scene through a fixed chain of
//! stages: frame extraction, scene generation and style transfer. Each job
//! is an explicit state machine driven one stage at a time by its callers.
//!
//! # Architecture
//!
//! - Job state changes are recorded as events in a per-job journal
//! - The in-memory registry is the authoritative view, rebuilt by replay
//! - Stages run outside any lock; a compare-and-swap decides who runs one
//! - Failed stages are re-run explicitly, never automatically
//!
//! # Modules
//!
//! - `core`: Orchestrator, registry, journal and retry driver
//! - `domain`: Data structures (Job, Stage, JobEvent, ArtifactRef)
//! - `executors`: Stage executors (simulated and external command)
//! - `store`: Artifact store
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run every stage for a video
//! gs3d run clip.mp4 --style starry.png
//!
//! # Step through a job manually
//! gs3d create clip.mp4
//! gs3d advance <job-id>
//! gs3d status <job-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod executors;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorError};
pub use domain::{ArtifactKind, ArtifactRef, JobId, JobSnapshot, Position, Stage, StageOutcome};
pub use store::{ArtifactStore, LocalArtifactStore};
