//! Job state and reconstruction from events.
//!
//! A Job is one run of the video-to-stylized-scene pipeline, tracked from
//! the initial upload through to a terminal state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{ArtifactKind, ArtifactRef};
use super::events::{EventType, JobEvent};
use super::stage::{Position, Stage};

/// Unique job identifier, generated at creation
pub type JobId = Uuid;

/// Why a stage did not produce its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// The executor reported a failure
    ExecutionFailed,

    /// The stage exceeded its deadline
    Timeout,

    /// The process stopped while the stage was in flight
    Interrupted,
}

/// Failure detail recorded on a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.stage, self.kind, self.message)
    }
}

/// The part of a job a compare-and-swap is guarded on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub position: Position,
    pub in_flight: Option<Stage>,
}

/// A pipeline job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job
    pub id: JobId,

    /// Current stage, or a terminal marker
    pub position: Position,

    /// Last stage whose output exists
    pub reached: Stage,

    /// Stage currently executing, if any
    pub in_flight: Option<Stage>,

    /// Attempt number of the in-flight (or most recent) stage execution
    pub attempt: u32,

    /// Stage outputs, append-only
    pub artifacts: BTreeMap<ArtifactKind, ArtifactRef>,

    /// Auxiliary inputs supplied out-of-band
    pub side_inputs: BTreeMap<ArtifactKind, ArtifactRef>,

    /// Present only while the job is failed
    pub last_error: Option<StageError>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job positioned at Ingest holding only its initial artifact
    pub fn new(id: JobId, initial: ArtifactRef) -> Self {
        let now = Utc::now();
        let mut artifacts = BTreeMap::new();
        artifacts.insert(Stage::Ingest.output_kind(), initial);

        Self {
            id,
            position: Position::Stage(Stage::Ingest),
            reached: Stage::Ingest,
            in_flight: None,
            attempt: 0,
            artifacts,
            side_inputs: BTreeMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstruct job state from a sequence of events
    pub fn from_events(events: &[JobEvent]) -> Option<Self> {
        let first = events.first()?;
        if first.event_type != EventType::JobCreated {
            return None;
        }

        let initial = first.artifact.clone()?;
        let mut job = Self::new(first.job_id, initial);
        job.created_at = first.timestamp;
        job.updated_at = first.timestamp;

        for event in &events[1..] {
            job.apply_event(event);
        }

        Some(job)
    }

    /// Apply a single event to update job state
    pub fn apply_event(&mut self, event: &JobEvent) {
        match event.event_type {
            EventType::JobCreated => {}
            EventType::SideInputAttached => {
                if let (Some(kind), Some(artifact)) = (event.artifact_kind, &event.artifact) {
                    self.side_inputs.insert(kind, artifact.clone());
                }
            }
            EventType::StageStarted => {
                if let Some(stage) = event.stage {
                    // A side input dispatched together with the stage
                    if let (Some(kind), Some(artifact)) = (event.artifact_kind, &event.artifact) {
                        self.side_inputs.insert(kind, artifact.clone());
                    }
                    self.in_flight = Some(stage);
                    self.attempt = event.attempt.unwrap_or(self.attempt + 1);
                    self.position = Position::Stage(self.reached);
                    self.last_error = None;
                }
            }
            EventType::StageCompleted => {
                if let Some(stage) = event.stage {
                    if let (Some(kind), Some(artifact)) = (event.artifact_kind, &event.artifact) {
                        self.artifacts.entry(kind).or_insert_with(|| artifact.clone());
                    }
                    self.reached = stage;
                    self.in_flight = None;
                    self.last_error = None;
                    self.position = if stage.is_final() {
                        Position::Completed
                    } else {
                        Position::Stage(stage)
                    };
                }
            }
            EventType::StageFailed => {
                self.in_flight = None;
                self.position = Position::Failed;
                self.last_error = event.error.clone();
            }
        }
        self.updated_at = event.timestamp;
    }

    pub fn guard(&self) -> Guard {
        Guard {
            position: self.position,
            in_flight: self.in_flight,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            position: self.position,
            reached: self.reached,
            in_flight: self.in_flight,
            attempt: self.attempt,
            artifacts: self.artifacts.clone(),
            side_inputs: self.side_inputs.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Consistent read-only view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub position: Position,
    pub reached: Stage,
    pub in_flight: Option<Stage>,
    pub attempt: u32,
    pub artifacts: BTreeMap<ArtifactKind, ArtifactRef>,
    pub side_inputs: BTreeMap<ArtifactKind, ArtifactRef>,
    pub last_error: Option<StageError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.artifacts.get(&kind)
    }

    pub fn is_terminal(&self) -> bool {
        self.position.is_terminal()
    }

    /// Guard value this snapshot was taken at
    pub fn guard(&self) -> Guard {
        Guard {
            position: self.position,
            in_flight: self.in_flight,
        }
    }

    /// The final stylized artifact, once the job has completed
    pub fn result(&self) -> Option<&ArtifactRef> {
        match self.position {
            Position::Completed => self.artifact(Stage::StyleTransfer.output_kind()),
            _ => None,
        }
    }
}

/// Result of a successful stage execution
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// The stage that ran
    pub stage: Stage,

    /// The artifact it produced
    pub artifact: ArtifactRef,

    /// Job state after the transition committed
    pub snapshot: JobSnapshot,
}
