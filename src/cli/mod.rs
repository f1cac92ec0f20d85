//! Command-line interface for gs3d.
//!
//! Provides commands for creating jobs from local files, advancing and
//! retrying stages, running a job end to end, and inspecting job state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{drive, JobJournal, JobRegistry, Orchestrator};
use crate::domain::{ArtifactKind, ArtifactRef, JobId, JobSnapshot, Stage, StageOutcome};
use crate::executors::ExecutorSet;
use crate::store::{ArtifactSource, ArtifactStore, LocalArtifactStore};

/// gs3d - Video to stylized 3D scene job orchestrator
#[derive(Parser, Debug)]
#[command(name = "gs3d")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a job from a video and run every stage to completion
    Run {
        /// Video file to process
        video: PathBuf,

        /// Style image for the final stage
        #[arg(short, long)]
        style: PathBuf,
    },

    /// Create a job from a video without running any stage
    Create {
        /// Video file to process
        video: PathBuf,
    },

    /// Attach a style image to a job
    Style {
        /// Job ID (UUID)
        job_id: String,

        /// Style image file
        image: PathBuf,
    },

    /// Run the next stage of a job
    Advance {
        /// Job ID (UUID)
        job_id: String,

        /// Style image to attach first
        #[arg(short, long)]
        style: Option<PathBuf>,
    },

    /// Re-run the stage a failed job stopped at
    Retry {
        /// Job ID (UUID)
        job_id: String,

        /// Style image to attach first
        #[arg(short, long)]
        style: Option<PathBuf>,
    },

    /// Check the status of a job
    Status {
        /// Job ID (UUID)
        job_id: String,
    },

    /// List recent jobs
    Jobs {
        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { video, style } => run_job(&video, &style).await,
            Commands::Create { video } => create_job(&video).await,
            Commands::Style { job_id, image } => attach_style(&job_id, &image).await,
            Commands::Advance { job_id, style } => {
                advance_job(&job_id, style.as_deref(), false).await
            }
            Commands::Retry { job_id, style } => {
                advance_job(&job_id, style.as_deref(), true).await
            }
            Commands::Status { job_id } => show_status(&job_id).await,
            Commands::Jobs { limit } => list_jobs(limit).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Open the store and journal and build an orchestrator owning all jobs
async fn open_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let registry = JobRegistry::recover(open_journal(cfg).await?).await?;
    build_orchestrator(cfg, registry).await
}

/// Same as `open_orchestrator` but leaves in-flight jobs untouched
async fn open_read_only(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let registry = JobRegistry::load(open_journal(cfg).await?).await?;
    build_orchestrator(cfg, registry).await
}

async fn open_journal(cfg: &ResolvedConfig) -> Result<JobJournal> {
    JobJournal::open(cfg.jobs_dir()).await
}

async fn build_orchestrator(cfg: &ResolvedConfig, registry: JobRegistry) -> Result<Orchestrator> {
    let store: Arc<dyn ArtifactStore> = Arc::new(
        LocalArtifactStore::open(&cfg.artifacts_dir)
            .await
            .context("Failed to open artifact store")?,
    );
    let executors = ExecutorSet::from_config(cfg, store.clone());

    Ok(Orchestrator::with_registry(registry, store, executors).with_timeouts(cfg.stage_timeouts()))
}

/// Copy a local file into the artifact store
async fn import(orchestrator: &Orchestrator, kind: ArtifactKind, path: &Path) -> Result<ArtifactRef> {
    if !path.is_file() {
        anyhow::bail!("Not a file: {}", path.display());
    }

    let artifact = orchestrator
        .store()
        .put(kind, ArtifactSource::File(path))
        .await
        .with_context(|| format!("Failed to import {}", path.display()))?;
    Ok(artifact)
}

fn parse_job_id(job_id: &str) -> Result<JobId> {
    Uuid::parse_str(job_id).with_context(|| format!("Invalid job ID: {}", job_id))
}

/// Create a job and drive it to completion
async fn run_job(video: &Path, style: &Path) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = open_orchestrator(cfg).await?;

    let video = import(&orchestrator, ArtifactKind::Video, video).await?;
    let style = import(&orchestrator, ArtifactKind::StyleImage, style).await?;

    let job = orchestrator.create_job(video).await?;
    orchestrator.attach_side_input(job.id, style).await?;
    eprintln!("[Job {} created]", job.id);

    match drive(&orchestrator, job.id, &cfg.retry).await {
        Ok(done) => {
            if let Some(result) = done.result() {
                let path = orchestrator.store().resolve(result).await?;
                println!("{}", path.display());
            }
            eprintln!("\n[Job {} completed successfully]", done.id);
        }
        Err(e) => {
            eprintln!("\n[Job {} failed: {}]", job.id, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn create_job(video: &Path) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = open_orchestrator(cfg).await?;

    let video = import(&orchestrator, ArtifactKind::Video, video).await?;
    let job = orchestrator.create_job(video).await?;

    println!("{}", job.id);
    Ok(())
}

async fn attach_style(job_id: &str, image: &Path) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let cfg = config::config()?;
    let orchestrator = open_orchestrator(cfg).await?;

    let style = import(&orchestrator, ArtifactKind::StyleImage, image).await?;
    let job = orchestrator.attach_side_input(job_id, style).await?;

    eprintln!("[Style image attached to job {}]", job.id);
    Ok(())
}

/// Run (or re-run) a single stage
async fn advance_job(job_id: &str, style: Option<&Path>, retry: bool) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let cfg = config::config()?;
    let orchestrator = open_orchestrator(cfg).await?;

    let style = match style {
        Some(path) => Some(import(&orchestrator, ArtifactKind::StyleImage, path).await?),
        None => None,
    };

    let result = if retry {
        orchestrator.retry_stage(job_id, style).await
    } else {
        orchestrator.advance_stage(job_id, style).await
    };

    match result {
        Ok(StageOutcome {
            stage,
            artifact,
            snapshot,
        }) => {
            println!("{}", artifact);
            eprintln!("\n[Stage {} done, job {} now at {}]", stage, snapshot.id, snapshot.position);
        }
        Err(e) => {
            eprintln!("\n[Job {}: {} ({:?})]", job_id, e, e.category());
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Show the status of a job
async fn show_status(job_id: &str) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let cfg = config::config()?;
    let orchestrator = open_read_only(cfg).await?;
    let job = orchestrator.get_status(job_id).await?;

    print_job(&job);
    Ok(())
}

fn print_job(job: &JobSnapshot) {
    println!("Job ID: {}", job.id);
    println!("Position: {}", job.position);
    if let Some(stage) = job.in_flight {
        println!("Running: {} (attempt {})", stage, job.attempt);
    }
    println!("Created: {}", job.created_at);
    println!("Updated: {}", job.updated_at);

    println!("\nArtifacts:");
    for (kind, artifact) in &job.artifacts {
        println!("  {}: {}", kind, artifact);
    }
    if !job.side_inputs.is_empty() {
        println!("\nSide inputs:");
        for (kind, artifact) in &job.side_inputs {
            println!("  {}: {}", kind, artifact);
        }
    }
    if let Some(ref error) = job.last_error {
        println!("\nLast error: {}", error);
    }
}

/// List recent jobs
async fn list_jobs(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = open_read_only(cfg).await?;
    let jobs = orchestrator.list_jobs(limit).await;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<25}", "JOB ID", "POSITION", "CREATED");
    println!("{}", "-".repeat(83));

    for job in jobs {
        let position = match job.in_flight {
            Some(stage) => format!("running {}", stage),
            None => job.position.to_string(),
        };
        println!(
            "{:<38} {:<20} {:<25}",
            job.id,
            position,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("gs3d configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Artifacts: {}", cfg.artifacts_dir.display());
    println!("  Jobs:      {}", cfg.jobs_dir().display());
    println!();
    println!("Executor: {:?}", cfg.executor_mode);
    println!();
    println!("Stages:");
    for stage in Stage::EXECUTABLE {
        let settings = cfg.stage(stage);
        let command = settings
            .command
            .as_ref()
            .map(|c| c.program.clone())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<18} timeout {:>5}s  delay {:>5}ms  command {}",
            stage.key(),
            settings.timeout_seconds,
            settings.simulated_delay_ms,
            command
        );
    }
    println!();
    println!("Retry policy:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.retry.backoff_multiplier);

    Ok(())
}
