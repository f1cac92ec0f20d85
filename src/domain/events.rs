//! Journal events for job state changes.
//!
//! Every committed transition is recorded as an immutable event in the
//! job's append-only log, so job state can be rebuilt after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{ArtifactKind, ArtifactRef};
use super::job::{JobId, StageError};
use super::stage::Stage;

/// A single event in a job's append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The job this event belongs to
    pub job_id: JobId,

    /// Type of event
    pub event_type: EventType,

    /// Stage the event concerns (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    /// Kind of the artifact carried by this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_kind: Option<ArtifactKind>,

    /// Artifact recorded by this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,

    /// Attempt number for stage events (1-based)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for finished stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Failure detail for failed stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl JobEvent {
    /// Create a new event with the current timestamp
    pub fn new(job_id: JobId, event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            job_id,
            event_type,
            stage: None,
            artifact_kind: None,
            artifact: None,
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_artifact(mut self, kind: ArtifactKind, artifact: ArtifactRef) -> Self {
        self.artifact_kind = Some(kind);
        self.artifact = Some(artifact);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: StageError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a job's life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Job registered with its initial artifact
    JobCreated,

    /// A side input (style image) was attached
    SideInputAttached,

    /// A stage execution was dispatched, with any side input passed along
    StageStarted,

    /// A stage produced its output; the final stage also completes the job
    StageCompleted,

    /// A stage failed or timed out; the job is now failed
    StageFailed,
}
