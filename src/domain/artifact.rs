//! Artifacts flowing between pipeline stages.
//!
//! A reference is an opaque handle issued by the artifact store. The
//! orchestrator only ever checks that a reference resolves; it never looks
//! inside the blob.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, store-issued handle for a stored file or directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Wrap a raw reference string (forward slashes, relative to the store root)
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().replace('\\', "/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Kinds of artifacts a job can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Uploaded source video
    Video,

    /// Directory of extracted frames
    Frames,

    /// Reconstructed 3D scene (point cloud / mesh)
    Scene,

    /// Style reference image (side input)
    StyleImage,

    /// Stylized scene, the final product
    Stylized,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Video,
        ArtifactKind::Frames,
        ArtifactKind::Scene,
        ArtifactKind::StyleImage,
        ArtifactKind::Stylized,
    ];

    /// Store subdirectory holding artifacts of this kind
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Video => "videos",
            Self::Frames => "frames",
            Self::Scene => "scenes",
            Self::StyleImage => "styles",
            Self::Stylized => "results",
        }
    }

    /// Short label used in snapshots and CLI output
    pub fn label(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Frames => "frames",
            Self::Scene => "scene",
            Self::StyleImage => "style_image",
            Self::Stylized => "stylized",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
