//! Authoritative job state.
//!
//! The registry maps job IDs to jobs and is the only shared mutable
//! structure in the orchestrator. Every mutation is an event applied through
//! `compare_and_swap`, guarded on the job's `(position, in_flight)` pair.
//! Each job has its own lock, held only while a commit is applied, so jobs
//! never contend with each other and readers never wait on stage execution.
//!
//! When journaled, stage execution is also fenced across processes by the
//! journal's per-job stage lock, and in-memory state is resynced from the
//! journal whenever that lock is taken.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::error::OrchestratorError;
use super::journal::{JobJournal, StageLock};
use crate::domain::{
    EventType, Guard, Job, JobEvent, JobId, JobSnapshot, StageError, StageErrorKind,
};

type Entry = Arc<Mutex<Job>>;

/// In-memory job map, optionally backed by a journal
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Entry>>,
    journal: Option<JobJournal>,
}

impl JobRegistry {
    /// Registry without persistence
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that records every event in `journal`
    pub fn with_journal(journal: JobJournal) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            journal: Some(journal),
        }
    }

    /// Rebuild a registry from a journal without writing to it
    ///
    /// Jobs whose stage is in flight stay in flight; use this for read-only
    /// views while another process may still be executing.
    pub async fn load(journal: JobJournal) -> Result<Self> {
        let registry = Self::with_journal(journal.clone());

        for job_id in journal.list_jobs().await? {
            match reload(&journal, job_id).await? {
                Some(job) => registry.put(job),
                None => warn!(%job_id, "Journal has no creation event, skipping"),
            }
        }

        Ok(registry)
    }

    /// Rebuild a registry from a journal, failing abandoned stages
    ///
    /// Stage executions cannot be resumed, so a job whose stage is in flight
    /// with nobody holding its stage lock is marked failed as interrupted.
    /// Stages still locked by a live process are left alone.
    pub async fn recover(journal: JobJournal) -> Result<Self> {
        let registry = Self::load(journal.clone()).await?;

        for entry in registry.entries() {
            let mut job = entry.lock().await;
            let Some(stage) = job.in_flight else {
                continue;
            };

            let Some(_lock) = journal.try_lock_stage(job.id).await? else {
                info!(job_id = %job.id, %stage, "Stage is running elsewhere, leaving it in flight");
                continue;
            };

            // The holder may have finished between loading and locking
            if let Some(fresh) = reload(&journal, job.id).await? {
                *job = fresh;
            }
            mark_interrupted(&journal, &mut job).await?;
        }

        info!(jobs = registry.len(), "Job registry recovered");
        Ok(registry)
    }

    /// Take the right to execute a stage of `job_id`
    ///
    /// Returns `None` when another caller, in this process or another one,
    /// holds it. Once taken, the job is resynced from the journal; a stage
    /// the journal still shows in flight has no live executor and is marked
    /// interrupted. Without a journal only the compare-and-swap fences
    /// execution, and the returned lock is empty.
    pub async fn lock_stage(&self, job_id: JobId) -> Result<Option<StageLock>, OrchestratorError> {
        let Some(ref journal) = self.journal else {
            return Ok(Some(StageLock::default()));
        };
        if self.entry(job_id).is_none() && !journal.contains(job_id).await {
            return Err(OrchestratorError::UnknownJob(job_id));
        }

        let Some(lock) = journal.try_lock_stage(job_id).await.map_err(journal_error)? else {
            return Ok(None);
        };
        self.sync(journal, job_id, true).await?;
        Ok(Some(lock))
    }

    /// Snapshot of a job after picking up commits journaled elsewhere
    pub async fn refresh(&self, job_id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        if let Some(ref journal) = self.journal {
            self.sync(journal, job_id, false).await?;
        }
        self.get(job_id)
            .await
            .ok_or(OrchestratorError::UnknownJob(job_id))
    }

    /// Replace the in-memory job with the journal's view of it
    async fn sync(
        &self,
        journal: &JobJournal,
        job_id: JobId,
        interrupt: bool,
    ) -> Result<(), OrchestratorError> {
        let entry = match self.entry(job_id) {
            Some(entry) => entry,
            None => match reload(journal, job_id).await.map_err(journal_error)? {
                Some(job) => self.entry_or_insert(job),
                None => return Err(OrchestratorError::UnknownJob(job_id)),
            },
        };

        let mut job = entry.lock().await;
        if let Some(fresh) = reload(journal, job_id).await.map_err(journal_error)? {
            *job = fresh;
        }
        if interrupt {
            mark_interrupted(journal, &mut job)
                .await
                .map_err(journal_error)?;
        }
        Ok(())
    }

    fn entry(&self, job_id: JobId) -> Option<Entry> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(&job_id).cloned()
    }

    fn entries(&self) -> Vec<Entry> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.values().cloned().collect()
    }

    fn put(&self, job: Job) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id, Arc::new(Mutex::new(job)));
    }

    fn entry_or_insert(&self, job: Job) -> Entry {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.entry(job.id)
            .or_insert_with(|| Arc::new(Mutex::new(job)))
            .clone()
    }

    async fn record(&self, event: &JobEvent) -> Result<(), OrchestratorError> {
        if let Some(ref journal) = self.journal {
            journal.append(event).await.map_err(journal_error)?;
        }
        Ok(())
    }

    /// Snapshot of a job's committed state
    pub async fn get(&self, job_id: JobId) -> Option<JobSnapshot> {
        let entry = self.entry(job_id)?;
        let job = entry.lock().await;
        Some(job.snapshot())
    }

    /// Register a new job; `created` is its creation event
    pub async fn insert(&self, job: Job, created: JobEvent) -> Result<JobSnapshot, OrchestratorError> {
        self.record(&created).await?;
        let snapshot = job.snapshot();
        self.put(job);
        Ok(snapshot)
    }

    /// Apply `event` to the job if its guard still equals `expected`
    ///
    /// The event is journaled before the new state becomes visible; if the
    /// journal write fails the job is left unchanged.
    pub async fn compare_and_swap(
        &self,
        job_id: JobId,
        expected: Guard,
        event: JobEvent,
    ) -> Result<JobSnapshot, OrchestratorError> {
        let entry = self
            .entry(job_id)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        let mut job = entry.lock().await;

        if job.guard() != expected {
            return Err(OrchestratorError::ConcurrentModification(job_id));
        }

        let mut next = job.clone();
        next.apply_event(&event);
        self.record(&event).await?;

        *job = next;
        Ok(job.snapshot())
    }

    /// Release an in-flight stage in memory only, marking the job failed
    ///
    /// Used when the stage outcome could not be journaled; on the next
    /// recovery the journal shows the stage as interrupted.
    pub async fn abort_in_flight(&self, job_id: JobId, error: StageError) -> Option<JobSnapshot> {
        let entry = self.entry(job_id)?;
        let mut job = entry.lock().await;

        if let Some(stage) = job.in_flight {
            let event = JobEvent::new(job_id, EventType::StageFailed)
                .with_stage(stage)
                .with_error(error);
            job.apply_event(&event);
        }
        Some(job.snapshot())
    }

    /// Snapshots of every job, in no particular order
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let entries = self.entries();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.snapshot());
        }
        snapshots
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn reload(journal: &JobJournal, job_id: JobId) -> Result<Option<Job>> {
    let events = journal.replay(job_id).await?;
    Ok(Job::from_events(&events))
}

/// Journal an interrupted failure for an in-flight stage nobody executes
async fn mark_interrupted(journal: &JobJournal, job: &mut Job) -> Result<()> {
    let Some(stage) = job.in_flight else {
        return Ok(());
    };

    let event = JobEvent::new(job.id, EventType::StageFailed)
        .with_stage(stage)
        .with_attempt(job.attempt)
        .with_error(StageError::new(
            stage,
            StageErrorKind::Interrupted,
            "stage was in flight when its orchestrator stopped",
        ));
    journal.append(&event).await?;
    job.apply_event(&event);

    warn!(job_id = %job.id, %stage, "Marked interrupted stage as failed");
    Ok(())
}

fn journal_error(e: anyhow::Error) -> OrchestratorError {
    OrchestratorError::Journal(format!("{:#}", e))
}
