//! Job orchestrator.
//!
//! Owns the per-job state machine: validates transitions, dispatches stages
//! to their executors, enforces stage deadlines and commits outcomes through
//! the registry. Executors run outside any in-memory lock; the registry's
//! compare-and-swap decides which caller gets to run a stage, and the
//! journal's stage lock keeps other processes from running one meanwhile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::error::OrchestratorError;
use super::journal::StageLock;
use super::registry::JobRegistry;
use crate::domain::{
    ArtifactKind, ArtifactRef, EventType, Guard, Job, JobEvent, JobId, JobSnapshot, Position,
    Stage, StageError, StageErrorKind, StageOutcome,
};
use crate::executors::{ExecutorSet, StageExecutor};
use crate::store::ArtifactStore;

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Whether a dispatch runs the next stage or re-runs a failed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Advance,
    Retry,
}

/// A stage that has been claimed and is ready to execute
struct Claim {
    stage: Stage,
    attempt: u32,
    guard: Guard,
    input: ArtifactRef,
    side_input: Option<ArtifactRef>,
    executor: Arc<dyn StageExecutor>,
    lock: StageLock,
}

/// Main job orchestrator
pub struct Orchestrator {
    registry: JobRegistry,
    store: Arc<dyn ArtifactStore>,
    executors: ExecutorSet,
    timeouts: HashMap<Stage, Duration>,
}

impl Orchestrator {
    /// Create an orchestrator with an in-memory registry
    pub fn new(store: Arc<dyn ArtifactStore>, executors: ExecutorSet) -> Self {
        Self::with_registry(JobRegistry::new(), store, executors)
    }

    /// Create an orchestrator over an existing (e.g. recovered) registry
    pub fn with_registry(
        registry: JobRegistry,
        store: Arc<dyn ArtifactStore>,
        executors: ExecutorSet,
    ) -> Self {
        Self {
            registry,
            store,
            executors,
            timeouts: HashMap::new(),
        }
    }

    /// Override stage deadlines
    pub fn with_timeouts(mut self, timeouts: HashMap<Stage, Duration>) -> Self {
        self.timeouts.extend(timeouts);
        self
    }

    pub fn with_stage_timeout(mut self, stage: Stage, timeout: Duration) -> Self {
        self.timeouts.insert(stage, timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        self.timeouts
            .get(&stage)
            .copied()
            .unwrap_or(DEFAULT_STAGE_TIMEOUT)
    }

    /// Register a new job positioned at Ingest
    #[instrument(skip(self), fields(artifact = %initial))]
    pub async fn create_job(&self, initial: ArtifactRef) -> Result<JobSnapshot, OrchestratorError> {
        if !self.store.exists(&initial).await {
            return Err(OrchestratorError::InvalidArtifact { artifact: initial });
        }

        let job_id = Uuid::new_v4();
        let created = JobEvent::new(job_id, EventType::JobCreated)
            .with_artifact(Stage::Ingest.output_kind(), initial.clone());
        let snapshot = self
            .registry
            .insert(Job::new(job_id, initial), created)
            .await?;

        info!(%job_id, "Job created");
        Ok(snapshot)
    }

    /// Read-only snapshot of a job's committed state
    pub async fn get_status(&self, job_id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        self.registry
            .get(job_id)
            .await
            .ok_or(OrchestratorError::UnknownJob(job_id))
    }

    /// Most recently created jobs first
    pub async fn list_jobs(&self, limit: usize) -> Vec<JobSnapshot> {
        let mut jobs = self.registry.list().await;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Attach (or replace) a side input ahead of the stage that consumes it
    #[instrument(skip(self), fields(job_id = %job_id, artifact = %artifact))]
    pub async fn attach_side_input(
        &self,
        job_id: JobId,
        artifact: ArtifactRef,
    ) -> Result<JobSnapshot, OrchestratorError> {
        let kind = ArtifactKind::StyleImage;
        let lock = self.registry.lock_stage(job_id).await?;
        let job = self.registry.refresh(job_id).await?;

        // The lock holder is between taking it and starting its stage
        if lock.is_none() && job.in_flight.is_none() {
            return Err(OrchestratorError::ConcurrentModification(job_id));
        }

        let Some(artifact) = self.pending_side_input(&job, kind, artifact).await? else {
            return Ok(job);
        };

        let event = JobEvent::new(job_id, EventType::SideInputAttached).with_artifact(kind, artifact);
        let snapshot = self
            .registry
            .compare_and_swap(job_id, job.guard(), event)
            .await?;

        info!(%kind, "Side input attached");
        Ok(snapshot)
    }

    /// Validate a side input for attachment; `None` if it is already attached
    async fn pending_side_input(
        &self,
        job: &JobSnapshot,
        kind: ArtifactKind,
        artifact: ArtifactRef,
    ) -> Result<Option<ArtifactRef>, OrchestratorError> {
        if job.position == Position::Completed {
            return Err(OrchestratorError::JobCompleted(job.id));
        }
        if let Some(stage) = Stage::consuming_side_input(kind) {
            if job.in_flight == Some(stage) || job.reached >= stage {
                return Err(OrchestratorError::SideInputLocked { kind, stage });
            }
        }
        if job.side_inputs.get(&kind) == Some(&artifact) {
            return Ok(None);
        }
        if !self.store.exists(&artifact).await {
            return Err(OrchestratorError::InvalidArtifact { artifact });
        }
        Ok(Some(artifact))
    }

    /// Run the job's next stage
    ///
    /// Fails without touching the job if it is terminal, already running a
    /// stage, or missing an input for the stage. Execution failures and
    /// timeouts move the job to Failed and are never retried here.
    #[instrument(skip(self, side_input), fields(job_id = %job_id))]
    pub async fn advance_stage(
        &self,
        job_id: JobId,
        side_input: Option<ArtifactRef>,
    ) -> Result<StageOutcome, OrchestratorError> {
        self.dispatch(job_id, side_input, Dispatch::Advance).await
    }

    /// Re-run the stage that failed, keeping every artifact produced so far
    #[instrument(skip(self, side_input), fields(job_id = %job_id))]
    pub async fn retry_stage(
        &self,
        job_id: JobId,
        side_input: Option<ArtifactRef>,
    ) -> Result<StageOutcome, OrchestratorError> {
        self.dispatch(job_id, side_input, Dispatch::Retry).await
    }

    async fn dispatch(
        &self,
        job_id: JobId,
        side_input: Option<ArtifactRef>,
        mode: Dispatch,
    ) -> Result<StageOutcome, OrchestratorError> {
        let lock = self.lock_stage(job_id).await?;
        let job = self.get_status(job_id).await?;
        check_dispatchable(&job, mode)?;

        let attach = match side_input {
            Some(artifact) => {
                self.pending_side_input(&job, ArtifactKind::StyleImage, artifact)
                    .await?
            }
            None => None,
        };

        let claim = self.claim(&job, mode, attach, lock).await?;
        self.execute(job_id, claim).await
    }

    /// Take the job's stage lock, or report the stage its holder runs
    async fn lock_stage(&self, job_id: JobId) -> Result<StageLock, OrchestratorError> {
        if let Some(lock) = self.registry.lock_stage(job_id).await? {
            return Ok(lock);
        }

        let job = self.registry.refresh(job_id).await?;
        let stage = job
            .in_flight
            .or_else(|| job.reached.next())
            .ok_or(OrchestratorError::JobCompleted(job_id))?;
        Err(OrchestratorError::StageAlreadyRunning { job_id, stage })
    }

    /// Validate inputs and mark the stage as in flight
    ///
    /// A side input passed with the dispatch is committed by the same
    /// compare-and-swap that starts the stage.
    async fn claim(
        &self,
        job: &JobSnapshot,
        mode: Dispatch,
        attach: Option<ArtifactRef>,
        lock: StageLock,
    ) -> Result<Claim, OrchestratorError> {
        let stage = job
            .reached
            .next()
            .ok_or(OrchestratorError::JobCompleted(job.id))?;

        let mut view = job.clone();
        if let Some(ref artifact) = attach {
            view.side_inputs
                .insert(ArtifactKind::StyleImage, artifact.clone());
        }

        let input_kind = stage
            .input_kind()
            .ok_or(OrchestratorError::NoExecutor(stage))?;
        let input = self.require_input(&view, stage, input_kind).await?;
        if let Some(kind) = stage.side_input_kind() {
            self.require_input(&view, stage, kind).await?;
        }

        let executor = self
            .executors
            .get(stage)
            .cloned()
            .ok_or(OrchestratorError::NoExecutor(stage))?;

        let attempt = match mode {
            Dispatch::Retry => job.attempt + 1,
            Dispatch::Advance => 1,
        };
        let mut started = JobEvent::new(job.id, EventType::StageStarted)
            .with_stage(stage)
            .with_attempt(attempt);
        if let Some(artifact) = attach {
            started = started.with_artifact(ArtifactKind::StyleImage, artifact);
        }

        let snapshot = match self
            .registry
            .compare_and_swap(job.id, job.guard(), started)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(OrchestratorError::ConcurrentModification(_)) => {
                // Lost the race; report what the winner is doing
                let current = self.get_status(job.id).await?;
                return Err(match current.in_flight {
                    Some(stage) => OrchestratorError::StageAlreadyRunning {
                        job_id: job.id,
                        stage,
                    },
                    None => OrchestratorError::ConcurrentModification(job.id),
                });
            }
            Err(e) => return Err(e),
        };

        // Execute with the side input the job records, not the one validated
        let side_input = stage
            .side_input_kind()
            .and_then(|kind| snapshot.side_inputs.get(&kind).cloned());

        Ok(Claim {
            stage,
            attempt,
            guard: snapshot.guard(),
            input,
            side_input,
            executor,
            lock,
        })
    }

    async fn require_input(
        &self,
        job: &JobSnapshot,
        stage: Stage,
        kind: ArtifactKind,
    ) -> Result<ArtifactRef, OrchestratorError> {
        let artifact = job
            .artifacts
            .get(&kind)
            .or_else(|| job.side_inputs.get(&kind))
            .ok_or(OrchestratorError::MissingInput { stage, kind })?;

        if !self.store.exists(artifact).await {
            warn!(job_id = %job.id, %stage, %artifact, "Recorded input no longer resolves");
            return Err(OrchestratorError::MissingInput { stage, kind });
        }
        Ok(artifact.clone())
    }

    async fn execute(&self, job_id: JobId, claim: Claim) -> Result<StageOutcome, OrchestratorError> {
        let Claim {
            stage,
            attempt,
            guard,
            input,
            side_input,
            executor,
            lock: _held,
        } = claim;

        let timeout = self.stage_timeout(stage);
        info!(%stage, attempt, executor = executor.name(), "Stage started");

        let started_at = Instant::now();
        let result = tokio::time::timeout(timeout, executor.execute(&input, side_input.as_ref())).await;
        let duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        let artifact = match result {
            Ok(Ok(artifact)) => {
                if !self.store.exists(&artifact).await {
                    let message = format!("executor returned unresolvable artifact {}", artifact);
                    return self
                        .fail(job_id, guard, stage, attempt, duration_ms, StageErrorKind::ExecutionFailed, message)
                        .await;
                }
                artifact
            }
            Ok(Err(e)) => {
                return self
                    .fail(job_id, guard, stage, attempt, duration_ms, StageErrorKind::ExecutionFailed, e.to_string())
                    .await;
            }
            Err(_) => {
                let message = format!("no result within {:?}", timeout);
                return self
                    .fail(job_id, guard, stage, attempt, duration_ms, StageErrorKind::Timeout, message)
                    .await;
            }
        };

        let completed = JobEvent::new(job_id, EventType::StageCompleted)
            .with_stage(stage)
            .with_artifact(stage.output_kind(), artifact.clone())
            .with_attempt(attempt)
            .with_duration(duration_ms);

        match self.registry.compare_and_swap(job_id, guard, completed).await {
            Ok(snapshot) => {
                info!(%stage, duration_ms, position = %snapshot.position, "Stage completed");
                Ok(StageOutcome {
                    stage,
                    artifact,
                    snapshot,
                })
            }
            Err(e) => Err(self.abandon(job_id, stage, e).await),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        job_id: JobId,
        guard: Guard,
        stage: Stage,
        attempt: u32,
        duration_ms: u64,
        kind: StageErrorKind,
        message: String,
    ) -> Result<StageOutcome, OrchestratorError> {
        let returned = match kind {
            StageErrorKind::Timeout => OrchestratorError::StageTimeout {
                stage,
                timeout: self.stage_timeout(stage),
            },
            _ => OrchestratorError::ExecutionFailed {
                stage,
                message: message.clone(),
            },
        };

        error!(%stage, attempt, error = %message, "Stage failed");
        let failed = JobEvent::new(job_id, EventType::StageFailed)
            .with_stage(stage)
            .with_attempt(attempt)
            .with_duration(duration_ms)
            .with_error(StageError::new(stage, kind, message));

        match self.registry.compare_and_swap(job_id, guard, failed).await {
            Ok(_) => Err(returned),
            Err(e) => {
                self.abandon(job_id, stage, e).await;
                Err(returned)
            }
        }
    }

    /// The stage outcome could not be committed; release the job in memory
    async fn abandon(&self, job_id: JobId, stage: Stage, cause: OrchestratorError) -> OrchestratorError {
        error!(%stage, error = %cause, "Failed to commit stage outcome");
        self.registry
            .abort_in_flight(
                job_id,
                StageError::new(stage, StageErrorKind::Interrupted, cause.to_string()),
            )
            .await;
        cause
    }
}

fn check_dispatchable(job: &JobSnapshot, mode: Dispatch) -> Result<(), OrchestratorError> {
    if let Some(stage) = job.in_flight {
        return Err(OrchestratorError::StageAlreadyRunning {
            job_id: job.id,
            stage,
        });
    }

    match (job.position, mode) {
        (Position::Completed, _) => Err(OrchestratorError::JobCompleted(job.id)),
        (Position::Failed, Dispatch::Advance) => Err(OrchestratorError::JobFailed(job.id)),
        (Position::Stage(_), Dispatch::Retry) => Err(OrchestratorError::NotRetriable {
            job_id: job.id,
            position: job.position,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{ExecutionError, SimulatedExecutor};
    use crate::store::{ArtifactSource, LocalArtifactStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Failing;

    #[async_trait]
    impl StageExecutor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            _input: &ArtifactRef,
            _side_input: Option<&ArtifactRef>,
        ) -> Result<ArtifactRef, ExecutionError> {
            Err(ExecutionError::InvalidInput("boom".to_string()))
        }
    }

    async fn setup() -> (Orchestrator, ArtifactRef, ArtifactRef, TempDir) {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::open(temp.path()).await.unwrap());

        let video = store
            .put(
                ArtifactKind::Video,
                ArtifactSource::Bytes {
                    file_name: "clip.mp4",
                    data: b"not really a video",
                },
            )
            .await
            .unwrap();
        let style = store
            .put(
                ArtifactKind::StyleImage,
                ArtifactSource::Bytes {
                    file_name: "style.png",
                    data: b"not really a png",
                },
            )
            .await
            .unwrap();

        let mut executors = ExecutorSet::new();
        for stage in Stage::EXECUTABLE {
            executors = executors.with(
                stage,
                Arc::new(SimulatedExecutor::new(stage, Duration::ZERO, store.clone())),
            );
        }

        (Orchestrator::new(store, executors), video, style, temp)
    }

    #[tokio::test]
    async fn test_create_job_rejects_unknown_artifact() {
        let (orchestrator, _, _, _temp) = setup().await;

        let result = orchestrator
            .create_job(ArtifactRef::new("videos/missing.mp4"))
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidArtifact { .. })));
        assert!(orchestrator.list_jobs(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_full_run() {
        let (orchestrator, video, style, _temp) = setup().await;
        let job = orchestrator.create_job(video).await.unwrap();

        let frames = orchestrator.advance_stage(job.id, None).await.unwrap();
        assert_eq!(frames.snapshot.position, Position::Stage(Stage::FrameExtraction));

        orchestrator.advance_stage(job.id, None).await.unwrap();
        let done = orchestrator
            .advance_stage(job.id, Some(style))
            .await
            .unwrap();

        assert_eq!(done.stage, Stage::StyleTransfer);
        assert_eq!(done.snapshot.position, Position::Completed);
        assert_eq!(done.snapshot.result(), Some(&done.artifact));
    }

    #[tokio::test]
    async fn test_style_transfer_requires_side_input() {
        let (orchestrator, video, _, _temp) = setup().await;
        let job = orchestrator.create_job(video).await.unwrap();
        orchestrator.advance_stage(job.id, None).await.unwrap();
        orchestrator.advance_stage(job.id, None).await.unwrap();

        let result = orchestrator.advance_stage(job.id, None).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::MissingInput {
                stage: Stage::StyleTransfer,
                kind: ArtifactKind::StyleImage,
            })
        ));

        let status = orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(status.position, Position::Stage(Stage::SceneGeneration));
        assert!(status.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_failed_stage_then_retry() {
        let (orchestrator, video, _, _temp) = setup().await;
        let store = orchestrator.store().clone();
        let flaky = Orchestrator::new(
            store.clone(),
            ExecutorSet::new()
                .with(
                    Stage::FrameExtraction,
                    Arc::new(SimulatedExecutor::new(Stage::FrameExtraction, Duration::ZERO, store)),
                )
                .with(Stage::SceneGeneration, Arc::new(Failing)),
        );

        let job = flaky.create_job(video).await.unwrap();
        flaky.advance_stage(job.id, None).await.unwrap();

        let err = flaky.advance_stage(job.id, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionFailed { .. }));

        let status = flaky.get_status(job.id).await.unwrap();
        assert_eq!(status.position, Position::Failed);
        assert!(status.artifact(ArtifactKind::Frames).is_some());
        assert!(status.artifact(ArtifactKind::Scene).is_none());
        assert_eq!(status.last_error.unwrap().stage, Stage::SceneGeneration);

        assert!(matches!(
            flaky.advance_stage(job.id, None).await,
            Err(OrchestratorError::JobFailed(_))
        ));

        // Retry runs the same stage again and fails again, bumping the attempt
        let err = flaky.retry_stage(job.id, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionFailed { .. }));
        assert_eq!(flaky.get_status(job.id).await.unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_job() {
        let (orchestrator, video, _, _temp) = setup().await;
        let job = orchestrator.create_job(video).await.unwrap();

        let result = orchestrator.retry_stage(job.id, None).await;
        assert!(matches!(result, Err(OrchestratorError::NotRetriable { .. })));
    }

    #[tokio::test]
    async fn test_side_input_locked_after_completion() {
        let (orchestrator, video, style, _temp) = setup().await;
        let job = orchestrator.create_job(video).await.unwrap();
        orchestrator
            .attach_side_input(job.id, style.clone())
            .await
            .unwrap();
        for _ in 0..3 {
            orchestrator.advance_stage(job.id, None).await.unwrap();
        }

        let result = orchestrator.attach_side_input(job.id, style).await;
        assert!(matches!(result, Err(OrchestratorError::JobCompleted(_))));
    }

    #[tokio::test]
    async fn test_list_jobs_most_recent_first() {
        let (orchestrator, video, _, _temp) = setup().await;
        let first = orchestrator.create_job(video.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = orchestrator.create_job(video).await.unwrap();

        let jobs = orchestrator.list_jobs(10).await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second.id);
        assert_eq!(jobs[1].id, first.id);
        assert_eq!(orchestrator.list_jobs(1).await.len(), 1);
    }
}
