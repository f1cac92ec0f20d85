//! Caller-side driver that pushes a job to completion.
//!
//! The orchestrator never retries on its own. This driver is the caller
//! that does: it advances stage by stage, re-runs a failed stage through
//! `retry_stage` with exponential backoff, and waits out transient
//! concurrency errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{ErrorCategory, OrchestratorError};
use super::orchestrator::Orchestrator;
use crate::domain::{JobId, JobSnapshot, Position};

/// Retry policy for failed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per stage (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never re-runs a failed stage
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Whether a stage that has run `attempt` times may run again
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Advance `job_id` until it completes or a non-retriable error occurs
///
/// Side inputs must already be attached; a missing one surfaces as
/// `MissingInput` once the consuming stage is reached.
pub async fn drive(
    orchestrator: &Orchestrator,
    job_id: JobId,
    policy: &RetryPolicy,
) -> Result<JobSnapshot, OrchestratorError> {
    loop {
        let job = orchestrator.get_status(job_id).await?;

        let result = match (job.position, job.in_flight) {
            (Position::Completed, _) => return Ok(job),
            (_, Some(stage)) => Err(OrchestratorError::StageAlreadyRunning { job_id, stage }),
            (Position::Failed, None) => {
                if !policy.should_retry(job.attempt) {
                    return Err(last_failure(&job));
                }
                let delay = policy.delay_for_attempt(job.attempt);
                warn!(%job_id, attempt = job.attempt, ?delay, "Retrying failed stage");
                tokio::time::sleep(delay).await;
                orchestrator.retry_stage(job_id, None).await
            }
            (Position::Stage(_), None) => orchestrator.advance_stage(job_id, None).await,
        };

        match result {
            Ok(outcome) => {
                info!(%job_id, stage = %outcome.stage, artifact = %outcome.artifact, "Stage done");
            }
            Err(e) if e.is_transient() => {
                tokio::time::sleep(policy.delay_for_attempt(1)).await;
            }
            // Failure is recorded on the job; the next pass decides on retry
            Err(e) if e.category() == ErrorCategory::Execution => {
                warn!(%job_id, error = %e, "Stage failed");
            }
            Err(e) => return Err(e),
        }
    }
}

fn last_failure(job: &JobSnapshot) -> OrchestratorError {
    match job.last_error {
        Some(ref error) => OrchestratorError::ExecutionFailed {
            stage: error.stage,
            message: error.message.clone(),
        },
        None => OrchestratorError::JobFailed(job.id),
    }
}
