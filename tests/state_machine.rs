//! State Machine Integration Tests
//!
//! Tests for job creation, stage ordering, side inputs and terminal states.

mod common;

use common::{Behavior, Harness};
use gs3d::{ArtifactKind, ArtifactRef, OrchestratorError, Position, Stage};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

#[tokio::test]
async fn test_create_then_advance_to_frame_extraction() {
    let h = Harness::new().await;

    let job = h.orchestrator.create_job(h.video.clone()).await.unwrap();
    assert_eq!(job.position, Position::Stage(Stage::Ingest));
    assert_eq!(job.artifacts.len(), 1);
    assert_eq!(job.artifact(ArtifactKind::Video), Some(&h.video));

    let outcome = h.orchestrator.advance_stage(job.id, None).await.unwrap();

    assert_eq!(outcome.stage, Stage::FrameExtraction);
    assert_eq!(outcome.snapshot.position, Position::Stage(Stage::FrameExtraction));
    assert_eq!(
        outcome.snapshot.artifact(ArtifactKind::Frames),
        Some(&outcome.artifact)
    );
    assert_eq!(outcome.snapshot.artifact(ArtifactKind::Video), Some(&h.video));
    assert_eq!(h.fake(Stage::FrameExtraction).calls(), 1);
}

#[tokio::test]
async fn test_create_job_rejects_unresolvable_artifact() {
    let h = Harness::new().await;

    let result = h
        .orchestrator
        .create_job(ArtifactRef::new("videos/never-uploaded.mp4"))
        .await;

    assert!(matches!(result, Err(OrchestratorError::InvalidArtifact { .. })));
    assert!(h.orchestrator.list_jobs(10).await.is_empty());
}

#[tokio::test]
async fn test_unknown_job() {
    let h = Harness::new().await;
    let id = Uuid::new_v4();

    assert!(matches!(
        h.orchestrator.get_status(id).await,
        Err(OrchestratorError::UnknownJob(_))
    ));
    assert!(matches!(
        h.orchestrator.advance_stage(id, None).await,
        Err(OrchestratorError::UnknownJob(_))
    ));
    assert!(matches!(
        h.orchestrator.retry_stage(id, None).await,
        Err(OrchestratorError::UnknownJob(_))
    ));
}

#[tokio::test]
async fn test_side_input_only_required_by_style_transfer() {
    let h = Harness::new().await;
    let job = h.orchestrator.create_job(h.video.clone()).await.unwrap();

    // The first two stages run without any style image
    assert_ok!(h.orchestrator.advance_stage(job.id, None).await);
    assert_ok!(h.orchestrator.advance_stage(job.id, None).await);

    let result = h.orchestrator.advance_stage(job.id, None).await;
    assert!(matches!(
        result,
        Err(OrchestratorError::MissingInput {
            stage: Stage::StyleTransfer,
            kind: ArtifactKind::StyleImage,
        })
    ));
    assert_eq!(h.fake(Stage::StyleTransfer).calls(), 0);

    let status = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(status.position, Position::Stage(Stage::SceneGeneration));
    assert!(status.last_error.is_none());

    // Supplying the side input with the call lets the final stage run
    let done = h
        .orchestrator
        .advance_stage(job.id, Some(h.style.clone()))
        .await
        .unwrap();
    assert_eq!(done.snapshot.position, Position::Completed);
    assert_eq!(done.snapshot.result(), Some(&done.artifact));
    assert_eq!(h.fake(Stage::StyleTransfer).calls(), 1);
}

#[tokio::test]
async fn test_completed_job_is_never_mutated() {
    let h = Harness::new().await;
    let job = h.orchestrator.create_job(h.video.clone()).await.unwrap();
    h.orchestrator
        .attach_side_input(job.id, h.style.clone())
        .await
        .unwrap();
    for _ in 0..3 {
        h.orchestrator.advance_stage(job.id, None).await.unwrap();
    }

    let before = h.orchestrator.get_status(job.id).await.unwrap();
    let calls = h.total_calls();
    assert_eq!(before.position, Position::Completed);

    for _ in 0..2 {
        assert!(matches!(
            h.orchestrator.advance_stage(job.id, None).await,
            Err(OrchestratorError::JobCompleted(_))
        ));
    }
    assert!(matches!(
        h.orchestrator.advance_stage(job.id, Some(h.style.clone())).await,
        Err(OrchestratorError::JobCompleted(_))
    ));
    assert!(matches!(
        h.orchestrator.retry_stage(job.id, None).await,
        Err(OrchestratorError::JobCompleted(_))
    ));
    assert_err!(h.orchestrator.attach_side_input(job.id, h.style.clone()).await);

    let after = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(h.total_calls(), calls);
}

#[tokio::test]
async fn test_positions_and_artifacts_only_grow() {
    let h = Harness::new().await;
    let job = h.orchestrator.create_job(h.video.clone()).await.unwrap();
    h.orchestrator
        .attach_side_input(job.id, h.style.clone())
        .await
        .unwrap();

    let mut previous = job;
    while !previous.is_terminal() {
        let next = h
            .orchestrator
            .advance_stage(previous.id, None)
            .await
            .unwrap()
            .snapshot;

        assert!(next.position.rank() > previous.position.rank());
        for (kind, artifact) in &previous.artifacts {
            assert_eq!(next.artifacts.get(kind), Some(artifact));
        }
        assert_eq!(next.artifacts.len(), previous.artifacts.len() + 1);
        previous = next;
    }

    assert_eq!(previous.position, Position::Completed);
    assert_eq!(previous.artifacts.len(), 4);
}

#[tokio::test]
async fn test_side_input_locked_while_consuming_stage_runs() {
    let h = Harness::with(|stage| match stage {
        Stage::StyleTransfer => Behavior::slow(Duration::from_millis(100)),
        _ => Behavior::default(),
    })
    .await;
    let job = h.orchestrator.create_job(h.video.clone()).await.unwrap();
    h.orchestrator.advance_stage(job.id, None).await.unwrap();
    h.orchestrator.advance_stage(job.id, None).await.unwrap();

    // Replacing the style image is fine before the stage starts
    let replacement = h
        .orchestrator
        .store()
        .put(
            ArtifactKind::StyleImage,
            gs3d::store::ArtifactSource::Bytes {
                file_name: "other.png",
                data: b"another style",
            },
        )
        .await
        .unwrap();
    h.orchestrator
        .attach_side_input(job.id, replacement.clone())
        .await
        .unwrap();

    let (advanced, attached) = tokio::join!(
        h.orchestrator.advance_stage(job.id, None),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.orchestrator.attach_side_input(job.id, h.style.clone()).await
        }
    );

    assert_ok!(advanced);
    assert!(matches!(
        attached,
        Err(OrchestratorError::SideInputLocked {
            kind: ArtifactKind::StyleImage,
            stage: Stage::StyleTransfer,
        })
    ));

    let status = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(status.side_inputs.get(&ArtifactKind::StyleImage), Some(&replacement));
}

#[tokio::test]
async fn test_attach_rejects_unresolvable_side_input() {
    let h = Harness::new().await;
    let job = h.orchestrator.create_job(h.video.clone()).await.unwrap();

    let result = h
        .orchestrator
        .attach_side_input(job.id, ArtifactRef::new("styles/missing.png"))
        .await;

    assert!(matches!(result, Err(OrchestratorError::InvalidArtifact { .. })));
    let status = h.orchestrator.get_status(job.id).await.unwrap();
    assert!(status.side_inputs.is_empty());
}
