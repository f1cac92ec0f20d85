//! Artifact storage.
//!
//! The store issues opaque references for files and directories and resolves
//! them back to a location. It holds no business logic.

pub mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ArtifactKind, ArtifactRef};

pub use local::LocalArtifactStore;

/// Content handed to the store
#[derive(Debug, Clone, Copy)]
pub enum ArtifactSource<'a> {
    /// In-memory bytes; the file name supplies the extension
    Bytes { file_name: &'a str, data: &'a [u8] },

    /// An existing file, copied into the store
    File(&'a Path),

    /// An existing directory (e.g. a frame set), copied recursively
    Directory(&'a Path),
}

/// Errors raised by an artifact store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(ArtifactRef),

    #[error("Invalid artifact reference: {0}")]
    InvalidRef(String),

    #[error("Invalid artifact source {path}: {reason}")]
    InvalidSource { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage for intermediate and final artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store content and return a reference to it
    async fn put(
        &self,
        kind: ArtifactKind,
        source: ArtifactSource<'_>,
    ) -> Result<ArtifactRef, StoreError>;

    /// Locate a stored artifact
    async fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError>;

    /// Whether the reference resolves
    async fn exists(&self, artifact: &ArtifactRef) -> bool {
        self.resolve(artifact).await.is_ok()
    }
}
