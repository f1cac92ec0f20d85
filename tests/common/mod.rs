//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use gs3d::core::{JobJournal, JobRegistry};
use gs3d::executors::{ExecutionError, ExecutorSet, StageExecutor};
use gs3d::store::{ArtifactSource, ArtifactStore, LocalArtifactStore};
use gs3d::{ArtifactKind, ArtifactRef, Orchestrator, Stage};

/// How a fake stage behaves
#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    pub delay: Duration,
    /// Number of calls that fail before the stage starts succeeding
    pub failures: u32,
}

impl Behavior {
    pub fn slow(delay: Duration) -> Self {
        Self { delay, failures: 0 }
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            delay: Duration::ZERO,
            failures,
        }
    }

    pub fn hanging() -> Self {
        Self::slow(Duration::from_secs(3600))
    }
}

/// Deterministic executor that counts its calls
pub struct FakeExecutor {
    stage: Stage,
    store: Arc<dyn ArtifactStore>,
    behavior: Behavior,
    failures_left: AtomicU32,
    calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(stage: Stage, store: Arc<dyn ArtifactStore>, behavior: Behavior) -> Self {
        Self {
            stage,
            store,
            behavior,
            failures_left: AtomicU32::new(behavior.failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for FakeExecutor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(
        &self,
        input: &ArtifactRef,
        side_input: Option<&ArtifactRef>,
    ) -> Result<ArtifactRef, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.behavior.delay).await;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExecutionError::Process {
                program: "fake".to_string(),
                code: 1,
                stderr: format!("{} diverged", self.stage),
            });
        }

        let data = format!(
            "{}:{}:{}",
            self.stage,
            input,
            side_input.map(|s| s.as_str()).unwrap_or("-")
        );
        let artifact = self
            .store
            .put(
                self.stage.output_kind(),
                ArtifactSource::Bytes {
                    file_name: "out.ply",
                    data: data.as_bytes(),
                },
            )
            .await?;
        Ok(artifact)
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub video: ArtifactRef,
    pub style: ArtifactRef,
    fakes: HashMap<Stage, Arc<FakeExecutor>>,
    pub temp: TempDir,
}

impl Harness {
    /// Every stage succeeds immediately
    pub async fn new() -> Self {
        Self::with(|_| Behavior::default()).await
    }

    /// In-memory orchestrator with per-stage fake behavior
    pub async fn with(behavior: impl Fn(Stage) -> Behavior) -> Self {
        let temp = TempDir::new().unwrap();
        let (orchestrator, fakes) = open(temp.path(), behavior, false).await;
        let (video, style) = seed_inputs(orchestrator.store()).await;

        Self {
            orchestrator,
            video,
            style,
            fakes,
            temp,
        }
    }

    /// Orchestrator persisted under the harness directory
    pub async fn journaled(behavior: impl Fn(Stage) -> Behavior) -> Self {
        let temp = TempDir::new().unwrap();
        let (orchestrator, fakes) = open(temp.path(), behavior, true).await;
        let (video, style) = seed_inputs(orchestrator.store()).await;

        Self {
            orchestrator,
            video,
            style,
            fakes,
            temp,
        }
    }

    pub fn with_timeout(mut self, stage: Stage, timeout: Duration) -> Self {
        self.orchestrator = self.orchestrator.with_stage_timeout(stage, timeout);
        self
    }

    pub fn fake(&self, stage: Stage) -> &FakeExecutor {
        &self.fakes[&stage]
    }

    pub fn total_calls(&self) -> usize {
        self.fakes.values().map(|f| f.calls()).sum()
    }
}

/// Build an orchestrator rooted at `root`, recovering its journal if asked
pub async fn open(
    root: &Path,
    behavior: impl Fn(Stage) -> Behavior,
    journaled: bool,
) -> (Orchestrator, HashMap<Stage, Arc<FakeExecutor>>) {
    let store: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::open(root.join("artifacts")).await.unwrap());

    let mut fakes = HashMap::new();
    let mut executors = ExecutorSet::new();
    for stage in Stage::EXECUTABLE {
        let fake = Arc::new(FakeExecutor::new(stage, store.clone(), behavior(stage)));
        executors = executors.with(stage, fake.clone());
        fakes.insert(stage, fake);
    }

    let registry = if journaled {
        let journal = JobJournal::open(root.join("jobs")).await.unwrap();
        JobRegistry::recover(journal).await.unwrap()
    } else {
        JobRegistry::new()
    };

    (
        Orchestrator::with_registry(registry, store, executors),
        fakes,
    )
}

pub async fn seed_inputs(store: &Arc<dyn ArtifactStore>) -> (ArtifactRef, ArtifactRef) {
    let video = store
        .put(
            ArtifactKind::Video,
            ArtifactSource::Bytes {
                file_name: "video.mp4",
                data: b"fake mp4 payload",
            },
        )
        .await
        .unwrap();
    let style = store
        .put(
            ArtifactKind::StyleImage,
            ArtifactSource::Bytes {
                file_name: "style.png",
                data: b"fake png payload",
            },
        )
        .await
        .unwrap();
    (video, style)
}
