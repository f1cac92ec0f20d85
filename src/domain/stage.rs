//! The fixed, linear stage sequence and a job's position in it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::artifact::ArtifactKind;

/// One step of the pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Video registered; no executor runs for this stage
    Ingest,

    /// Video -> frame set
    FrameExtraction,

    /// Frame set -> 3D scene
    SceneGeneration,

    /// Scene + style image -> stylized scene
    StyleTransfer,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Ingest,
        Stage::FrameExtraction,
        Stage::SceneGeneration,
        Stage::StyleTransfer,
    ];

    /// Stages that have an executor behind them
    pub const EXECUTABLE: [Stage; 3] = [
        Stage::FrameExtraction,
        Stage::SceneGeneration,
        Stage::StyleTransfer,
    ];

    /// Zero-based position in the sequence
    pub fn ordinal(&self) -> usize {
        match self {
            Self::Ingest => 0,
            Self::FrameExtraction => 1,
            Self::SceneGeneration => 2,
            Self::StyleTransfer => 3,
        }
    }

    /// The stage that follows this one, if any
    pub fn next(&self) -> Option<Stage> {
        Self::ALL.get(self.ordinal() + 1).copied()
    }

    pub fn is_final(&self) -> bool {
        self.next().is_none()
    }

    /// Main-chain input consumed by this stage (None for Ingest)
    pub fn input_kind(&self) -> Option<ArtifactKind> {
        match self {
            Self::Ingest => None,
            Self::FrameExtraction => Some(ArtifactKind::Video),
            Self::SceneGeneration => Some(ArtifactKind::Frames),
            Self::StyleTransfer => Some(ArtifactKind::Scene),
        }
    }

    /// Auxiliary input this stage requires
    pub fn side_input_kind(&self) -> Option<ArtifactKind> {
        match self {
            Self::StyleTransfer => Some(ArtifactKind::StyleImage),
            _ => None,
        }
    }

    /// Artifact produced once this stage has completed
    pub fn output_kind(&self) -> ArtifactKind {
        match self {
            Self::Ingest => ArtifactKind::Video,
            Self::FrameExtraction => ArtifactKind::Frames,
            Self::SceneGeneration => ArtifactKind::Scene,
            Self::StyleTransfer => ArtifactKind::Stylized,
        }
    }

    /// Config/CLI key for this stage
    pub fn key(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::FrameExtraction => "frame_extraction",
            Self::SceneGeneration => "scene_generation",
            Self::StyleTransfer => "style_transfer",
        }
    }

    /// The stage that consumes `kind` as its side input
    pub fn consuming_side_input(kind: ArtifactKind) -> Option<Stage> {
        Self::ALL
            .into_iter()
            .find(|s| s.side_input_kind() == Some(kind))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where a job currently sits: a stage, or one of the terminal markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Stage(Stage),
    Completed,
    Failed,
}

impl Position {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Rank for monotonicity checks; terminal markers sort after every stage
    pub fn rank(&self) -> usize {
        match self {
            Self::Stage(stage) => stage.ordinal(),
            Self::Completed | Self::Failed => Stage::ALL.len(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "{}", stage),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_linear() {
        assert_eq!(Stage::Ingest.next(), Some(Stage::FrameExtraction));
        assert_eq!(Stage::FrameExtraction.next(), Some(Stage::SceneGeneration));
        assert_eq!(Stage::SceneGeneration.next(), Some(Stage::StyleTransfer));
        assert_eq!(Stage::StyleTransfer.next(), None);
        assert!(Stage::StyleTransfer.is_final());
    }

    #[test]
    fn test_each_input_is_previous_output() {
        for stage in Stage::EXECUTABLE {
            let previous = Stage::ALL[stage.ordinal() - 1];
            assert_eq!(stage.input_kind(), Some(previous.output_kind()));
        }
    }

    #[test]
    fn test_only_style_transfer_needs_side_input() {
        assert_eq!(
            Stage::StyleTransfer.side_input_kind(),
            Some(ArtifactKind::StyleImage)
        );
        assert!(Stage::SceneGeneration.side_input_kind().is_none());
        assert_eq!(
            Stage::consuming_side_input(ArtifactKind::StyleImage),
            Some(Stage::StyleTransfer)
        );
    }

    #[test]
    fn test_position_serialization() {
        let json = serde_json::to_string(&Position::Stage(Stage::SceneGeneration)).unwrap();
        assert_eq!(json, r#"{"stage":"scene_generation"}"#);
        assert_eq!(serde_json::to_string(&Position::Failed).unwrap(), "\"failed\"");
    }
}
