//! Executor that runs an external program for a stage.
//!
//! The program is spawned with placeholder-substituted arguments:
//! `{input}`, `{side_input}` and `{output}` expand to resolved paths. The
//! program writes into a private staging location; only after a zero exit is
//! that output handed to the artifact store. Dropping the execution future
//! (e.g. on timeout) kills the child process.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionError, StageExecutor};
use crate::domain::{ArtifactKind, ArtifactRef, Stage};
use crate::store::{ArtifactSource, ArtifactStore, StoreError};

/// Program and argument template for a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Expand `{input}`, `{side_input}` and `{output}` in every argument
    pub fn render_args(&self, input: &Path, side_input: Option<&Path>, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let side = side_input
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{side_input}", &side)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

/// Stage executor backed by an external program
pub struct CommandExecutor {
    stage: Stage,
    spec: CommandSpec,
    store: Arc<dyn ArtifactStore>,
}

impl CommandExecutor {
    pub fn new(stage: Stage, spec: CommandSpec, store: Arc<dyn ArtifactStore>) -> Self {
        Self { stage, spec, store }
    }

    async fn resolve_input(&self, artifact: &ArtifactRef) -> Result<std::path::PathBuf, ExecutionError> {
        self.store.resolve(artifact).await.map_err(|e| match e {
            StoreError::NotFound(_) | StoreError::InvalidRef(_) => {
                ExecutionError::InvalidInput(e.to_string())
            }
            other => other.into(),
        })
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.spec.program
    }

    async fn execute(
        &self,
        input: &ArtifactRef,
        side_input: Option<&ArtifactRef>,
    ) -> Result<ArtifactRef, ExecutionError> {
        let input_path = self.resolve_input(input).await?;
        let side_path = match side_input {
            Some(side) => Some(self.resolve_input(side).await?),
            None => None,
        };

        let kind = self.stage.output_kind();
        let staging = tempfile::tempdir()?;
        let output_path = match kind {
            ArtifactKind::Frames => {
                let dir = staging.path().join("frames");
                tokio::fs::create_dir_all(&dir).await?;
                dir
            }
            _ => staging.path().join("output.ply"),
        };

        let args = self
            .spec
            .render_args(&input_path, side_path.as_deref(), &output_path);
        debug!(stage = %self.stage, program = %self.spec.program, ?args, "Spawning stage process");

        let output = Command::new(&self.spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExecutionError::Spawn {
                program: self.spec.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            warn!(stage = %self.stage, code, "Stage process failed");
            return Err(ExecutionError::Process {
                program: self.spec.program.clone(),
                code,
                stderr,
            });
        }

        let source = match kind {
            ArtifactKind::Frames => ArtifactSource::Directory(&output_path),
            _ => {
                if !tokio::fs::try_exists(&output_path).await? {
                    return Err(ExecutionError::MissingOutput(
                        output_path.display().to_string(),
                    ));
                }
                ArtifactSource::File(&output_path)
            }
        };

        let artifact = self.store.put(kind, source).await?;
        Ok(artifact)
    }
}
