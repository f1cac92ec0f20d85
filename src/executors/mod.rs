//! Stage executors.
//!
//! Each executor wraps one external processing capability (frame
//! extraction, scene generation, stylization) behind a uniform async
//! contract: given an input artifact and an optional side input, eventually
//! produce an output artifact or fail.

pub mod command;
pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ExecutorMode, ResolvedConfig};
use crate::domain::{ArtifactRef, Stage};
use crate::store::{ArtifactStore, StoreError};

pub use command::{CommandExecutor, CommandSpec};
pub use simulated::SimulatedExecutor;

/// Failures reported by an executor
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code}: {stderr}")]
    Process {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Executor produced no output at {0}")]
    MissingOutput(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform contract for a processing stage
///
/// Implementations must not mutate their input artifacts and must only hand
/// back references to fully written output, so that re-running with the same
/// input is always safe.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run the stage on `input` (and `side_input`, if the stage takes one)
    async fn execute(
        &self,
        input: &ArtifactRef,
        side_input: Option<&ArtifactRef>,
    ) -> Result<ArtifactRef, ExecutionError>;
}

/// Executors keyed by the stage they run
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for `stage`, replacing any previous one
    pub fn with(mut self, stage: Stage, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(stage, executor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageExecutor>> {
        self.executors.get(&stage)
    }

    /// Build executors for every executable stage from configuration
    pub fn from_config(config: &ResolvedConfig, store: Arc<dyn ArtifactStore>) -> Self {
        let mut set = Self::new();

        for stage in Stage::EXECUTABLE {
            let settings = config.stage(stage);
            let executor: Arc<dyn StageExecutor> = match (&config.executor_mode, &settings.command) {
                (ExecutorMode::Command, Some(spec)) => {
                    Arc::new(CommandExecutor::new(stage, spec.clone(), store.clone()))
                }
                _ => Arc::new(SimulatedExecutor::new(
                    stage,
                    settings.simulated_delay(),
                    store.clone(),
                )),
            };
            set = set.with(stage, executor);
        }

        set
    }
}
