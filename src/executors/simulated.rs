//! Fixed-delay executor standing in for the real processing backends.
//!
//! Waits a configured delay, then stores a small placeholder artifact of the
//! right shape: a frame directory with a manifest, or an ASCII PLY point
//! cloud for scene and stylized output.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionError, StageExecutor};
use crate::domain::{ArtifactRef, Stage};
use crate::store::{ArtifactSource, ArtifactStore, StoreError};

/// Executor that simulates a stage with a delay
pub struct SimulatedExecutor {
    stage: Stage,
    delay: Duration,
    store: Arc<dyn ArtifactStore>,
}

impl SimulatedExecutor {
    pub fn new(stage: Stage, delay: Duration, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            stage,
            delay,
            store,
        }
    }

    async fn require(&self, artifact: &ArtifactRef) -> Result<(), ExecutionError> {
        match self.store.resolve(artifact).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidRef(_)) => Err(
                ExecutionError::InvalidInput(format!("{} does not resolve", artifact)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn extract_frames(&self, video: &ArtifactRef) -> Result<ArtifactRef, ExecutionError> {
        let staging = tempfile::tempdir()?;
        let manifest = serde_json::json!({
            "source": video.as_str(),
            "frame_count": 0,
            "simulated": true,
        });
        tokio::fs::write(
            staging.path().join("manifest.json"),
            serde_json::to_vec_pretty(&manifest).unwrap_or_default(),
        )
        .await?;

        let artifact = self
            .store
            .put(
                self.stage.output_kind(),
                ArtifactSource::Directory(staging.path()),
            )
            .await?;
        Ok(artifact)
    }

    async fn write_point_cloud(&self, comments: &[String]) -> Result<ArtifactRef, ExecutionError> {
        let ply = placeholder_ply(comments);
        let artifact = self
            .store
            .put(
                self.stage.output_kind(),
                ArtifactSource::Bytes {
                    file_name: "scene.ply",
                    data: ply.as_bytes(),
                },
            )
            .await?;
        Ok(artifact)
    }
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(
        &self,
        input: &ArtifactRef,
        side_input: Option<&ArtifactRef>,
    ) -> Result<ArtifactRef, ExecutionError> {
        self.require(input).await?;
        if let Some(side) = side_input {
            self.require(side).await?;
        }

        debug!(stage = %self.stage, delay_ms = self.delay.as_millis() as u64, "Simulating stage");
        tokio::time::sleep(self.delay).await;

        match self.stage {
            Stage::Ingest => Err(ExecutionError::InvalidInput(
                "ingest has no processing step".to_string(),
            )),
            Stage::FrameExtraction => self.extract_frames(input).await,
            Stage::SceneGeneration => {
                self.write_point_cloud(&[format!("frames {}", input)]).await
            }
            Stage::StyleTransfer => {
                let style = side_input.ok_or_else(|| {
                    ExecutionError::InvalidInput("style transfer needs a style image".to_string())
                })?;
                self.write_point_cloud(&[format!("scene {}", input), format!("style {}", style)])
                    .await
            }
        }
    }
}

/// A single-vertex ASCII PLY with provenance comments
fn placeholder_ply(comments: &[String]) -> String {
    let mut ply = String::from("ply\nformat ascii 1.0\ncomment simulated output\n");
    for comment in comments {
        ply.push_str(&format!("comment {}\n", comment));
    }
    ply.push_str(
        "element vertex 1\nproperty float x\nproperty float y\nproperty float z\nend_header\n0 0 0\n",
    );
    ply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactKind;
    use crate::store::LocalArtifactStore;
    use tempfile::TempDir;

    async fn setup() -> (Arc<dyn ArtifactStore>, ArtifactRef, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(temp.path()).await.unwrap();
        let video = store
            .put(
                ArtifactKind::Video,
                ArtifactSource::Bytes {
                    file_name: "v.mp4",
                    data: b"video",
                },
            )
            .await
            .unwrap();
        (Arc::new(store), video, temp)
    }

    #[tokio::test]
    async fn test_frame_extraction_produces_directory() {
        let (store, video, _temp) = setup().await;
        let executor = SimulatedExecutor::new(Stage::FrameExtraction, Duration::ZERO, store.clone());

        let frames = executor.execute(&video, None).await.unwrap();

        assert!(frames.as_str().starts_with("frames/"));
        let dir = store.resolve(&frames).await.unwrap();
        assert!(dir.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn test_scene_generation_is_repeatable() {
        let (store, video, _temp) = setup().await;
        let executor = SimulatedExecutor::new(Stage::SceneGeneration, Duration::ZERO, store);

        let first = executor.execute(&video, None).await.unwrap();
        let second = executor.execute(&video, None).await.unwrap();

        assert!(first.as_str().ends_with(".ply"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unresolvable_input_is_rejected() {
        let (store, _video, _temp) = setup().await;
        let executor = SimulatedExecutor::new(Stage::SceneGeneration, Duration::ZERO, store);

        let result = executor
            .execute(&ArtifactRef::new("frames/missing"), None)
            .await;
        assert!(matches!(result, Err(ExecutionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_style_transfer_requires_style() {
        let (store, video, _temp) = setup().await;
        let executor = SimulatedExecutor::new(Stage::StyleTransfer, Duration::ZERO, store);

        let result = executor.execute(&video, None).await;
        assert!(matches!(result, Err(ExecutionError::InvalidInput(_))));
    }

    #[test]
    fn test_placeholder_ply_header() {
        let ply = placeholder_ply(&["scene scenes/x.ply".to_string()]);
        assert!(ply.starts_with("ply\nformat ascii 1.0\n"));
        assert!(ply.contains("comment scene scenes/x.ply\n"));
        assert!(ply.contains("end_header\n"));
    }
}
