//! Orchestrator failure signals.

use std::time::Duration;

use thiserror::Error;

use crate::domain::{ArtifactKind, ArtifactRef, JobId, Position, Stage};

/// Errors returned by orchestrator operations
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("Artifact does not resolve: {artifact}")]
    InvalidArtifact { artifact: ArtifactRef },

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Job {0} has failed; use retry to re-run the failed stage")]
    JobFailed(JobId),

    #[error("Job {0} has already completed")]
    JobCompleted(JobId),

    #[error("Job {job_id} is already running stage {stage}")]
    StageAlreadyRunning { job_id: JobId, stage: Stage },

    #[error("Stage {stage} is missing its {kind} input")]
    MissingInput { stage: Stage, kind: ArtifactKind },

    #[error("Stage {stage} exceeded its {}s deadline", .timeout.as_secs_f64())]
    StageTimeout { stage: Stage, timeout: Duration },

    #[error("Stage {stage} failed: {message}")]
    ExecutionFailed { stage: Stage, message: String },

    #[error("Job {0} changed concurrently; retry the operation")]
    ConcurrentModification(JobId),

    #[error("Job {job_id} is not failed (at {position}); nothing to retry")]
    NotRetriable { job_id: JobId, position: Position },

    #[error("The {kind} side input can no longer change: stage {stage} has started")]
    SideInputLocked { kind: ArtifactKind, stage: Stage },

    #[error("No executor registered for stage {0}")]
    NoExecutor(Stage),

    #[error("Journal error: {0}")]
    Journal(String),
}

/// Broad class of an error, for mapping to caller-visible statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller mistake; job state unchanged
    Input,
    /// Transient; retry after a short delay
    Concurrency,
    /// The processing step failed; the job is now failed
    Execution,
    /// The job is already terminal
    Terminal,
    /// Misconfiguration or persistence failure
    Internal,
}

impl OrchestratorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArtifact { .. }
            | Self::UnknownJob(_)
            | Self::MissingInput { .. }
            | Self::NotRetriable { .. }
            | Self::SideInputLocked { .. } => ErrorCategory::Input,
            Self::StageAlreadyRunning { .. } | Self::ConcurrentModification(_) => {
                ErrorCategory::Concurrency
            }
            Self::StageTimeout { .. } | Self::ExecutionFailed { .. } => ErrorCategory::Execution,
            Self::JobFailed(_) | Self::JobCompleted(_) => ErrorCategory::Terminal,
            Self::NoExecutor(_) | Self::Journal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the same call may succeed if repeated shortly
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Concurrency
    }
}
