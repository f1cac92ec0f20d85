//! Append-only job journal with file-based persistence.
//!
//! Each job gets `<base>/<job_id>/events.jsonl`, one JSON event per line.
//! Appends take an exclusive file lock so concurrent writers never
//! interleave partial lines. A second lock file, `stage.lock`, is held for as
//! long as a stage of the job executes.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::domain::{JobEvent, JobId};

const EVENTS_FILE: &str = "events.jsonl";
const STAGE_LOCK_FILE: &str = "stage.lock";

/// Exclusive right to execute a job's stages, released on drop
///
/// The lock is an fs2 lock on the job's `stage.lock`, so it excludes other
/// processes sharing the journal as well as other callers in this one.
/// The default value holds no file and is used when nothing is persisted.
#[derive(Debug, Default)]
pub struct StageLock {
    _file: Option<std::fs::File>,
}

/// File-based job journal using JSONL format
#[derive(Debug, Clone)]
pub struct JobJournal {
    base_dir: PathBuf,
}

impl JobJournal {
    /// Create or open a journal rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("Failed to create journal directory: {}", base_dir.display()))?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to a job's events file
    pub fn events_path(&self, job_id: JobId) -> PathBuf {
        self.base_dir.join(job_id.to_string()).join(EVENTS_FILE)
    }

    /// Whether the job has a log on disk
    pub async fn contains(&self, job_id: JobId) -> bool {
        fs::try_exists(self.events_path(job_id))
            .await
            .unwrap_or(false)
    }

    /// Take the job's stage lock without waiting
    ///
    /// Returns `None` while another holder has it.
    pub async fn try_lock_stage(&self, job_id: JobId) -> Result<Option<StageLock>> {
        let path = self.base_dir.join(job_id.to_string()).join(STAGE_LOCK_FILE);

        tokio::task::spawn_blocking(move || try_lock_file(&path))
            .await
            .context("Journal lock task panicked")?
    }

    /// Append an event to its job's log
    pub async fn append(&self, event: &JobEvent) -> Result<()> {
        let path = self.events_path(event.job_id);
        let line = serde_json::to_string(event).context("Failed to serialize event")?;

        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .context("Journal writer task panicked")?
    }

    /// Replay all events of a job in order
    pub async fn replay(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
        let path = self.events_path(job_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) if events.is_empty() => {
                    return Err(e).with_context(|| format!("Failed to parse event: {}", line));
                }
                // Torn line from a crash mid-append
                Err(e) => {
                    warn!(%job_id, error = %e, "Skipping unreadable journal line");
                }
            }
        }

        Ok(events)
    }

    /// List all job IDs with a journal
    pub async fn list_jobs(&self) -> Result<Vec<JobId>> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = JobId::parse_str(name) {
                        jobs.push(id);
                    }
                }
            }
        }

        Ok(jobs)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create job directory: {}", parent.display()))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_exclusive()
        .context("Failed to acquire file lock on events.jsonl")?;

    writeln!(file, "{}", line).context("Failed to write event")?;
    file.flush().context("Failed to flush event")?;
    file.sync_data().context("Failed to sync event")?;

    // Lock is released when file is dropped
    Ok(())
}

fn try_lock_file(path: &Path) -> Result<Option<StageLock>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create job directory: {}", parent.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(StageLock { _file: Some(file) })),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
    }
}
