//! Filesystem-backed artifact store.
//!
//! Layout under the store root:
//! - `<kind dir>/<sha256 prefix>.<ext>` for single files (content-addressed)
//! - `<kind dir>/<kind>_<uuid>/` for directories such as frame sets
//! - `.staging/` for in-progress writes, renamed into place when complete;
//!   entries left by a crashed writer are swept when the store is opened

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ArtifactSource, ArtifactStore, StoreError};
use crate::domain::{ArtifactKind, ArtifactRef};

const STAGING_DIR: &str = ".staging";

/// Staging entries older than this belong to no live writer
const STALE_STAGING_AGE: Duration = Duration::from_secs(3600);

/// Artifact store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;

        let store = Self { root };
        let swept = store.sweep_staging(STALE_STAGING_AGE).await?;
        if swept > 0 {
            warn!(swept, "Removed abandoned staging entries");
        }
        Ok(store)
    }

    /// Remove staging entries last modified more than `older_than` ago
    ///
    /// Other processes may share the store, so recent entries are kept.
    pub async fn sweep_staging(&self, older_than: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut swept = 0;
        let mut entries = fs::read_dir(self.root.join(STAGING_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= older_than {
                remove_entry(&entry.path()).await?;
                swept += 1;
            }
        }

        Ok(swept)
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string())
    }

    /// Move a fully written staging entry to its final place
    async fn commit(&self, staged: &Path, relative: String) -> Result<ArtifactRef, StoreError> {
        let dest = self.root.join(&relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&dest).await? {
            // Same content already stored under this address
            remove_entry(staged).await?;
        } else {
            fs::rename(staged, &dest).await?;
        }

        debug!(artifact = %relative, "Artifact committed");
        Ok(ArtifactRef::new(relative))
    }

    /// Map a reference to a path inside the store root
    fn locate(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        let raw = artifact.as_str();
        if raw.is_empty() {
            return Err(StoreError::InvalidRef(raw.to_string()));
        }

        let relative = Path::new(raw);
        let mut components = relative.components();
        let escapes = relative.components().any(|c| !matches!(c, Component::Normal(_)));
        let staged = matches!(components.next(), Some(Component::Normal(first)) if first == STAGING_DIR);
        if escapes || staged {
            return Err(StoreError::InvalidRef(raw.to_string()));
        }

        Ok(self.root.join(relative))
    }

    async fn put_bytes(
        &self,
        kind: ArtifactKind,
        file_name: &str,
        data: &[u8],
    ) -> Result<ArtifactRef, StoreError> {
        let staged = self.staging_path();
        if let Err(e) = fs::write(&staged, data).await {
            let _ = remove_entry(&staged).await;
            return Err(e.into());
        }

        let relative = format!("{}/{}{}", kind.dir_name(), hash_prefix(data), extension_of(file_name));
        self.commit(&staged, relative).await
    }

    async fn put_file(&self, kind: ArtifactKind, source: &Path) -> Result<ArtifactRef, StoreError> {
        if !fs::metadata(source).await.map(|m| m.is_file()).unwrap_or(false) {
            return Err(StoreError::InvalidSource {
                path: source.to_path_buf(),
                reason: "not a regular file".to_string(),
            });
        }

        let staged = self.staging_path();
        let (src, dst) = (source.to_path_buf(), staged.clone());
        let copied = tokio::task::spawn_blocking(move || copy_and_hash(&src, &dst))
            .await
            .map_err(std::io::Error::other)?;
        let hash = match copied {
            Ok(hash) => hash,
            Err(e) => {
                let _ = remove_entry(&staged).await;
                return Err(e.into());
            }
        };

        let file_name = source.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let relative = format!("{}/{}{}", kind.dir_name(), hash, extension_of(file_name));
        self.commit(&staged, relative).await
    }

    async fn put_directory(&self, kind: ArtifactKind, source: &Path) -> Result<ArtifactRef, StoreError> {
        if !fs::metadata(source).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(StoreError::InvalidSource {
                path: source.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let staged = self.staging_path();
        let (src, dst) = (source.to_path_buf(), staged.clone());
        let copied = tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
            .await
            .map_err(std::io::Error::other)?;
        if let Err(e) = copied {
            let _ = remove_entry(&staged).await;
            return Err(e.into());
        }

        let relative = format!("{}/{}_{}", kind.dir_name(), kind.label(), Uuid::new_v4());
        self.commit(&staged, relative).await
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        kind: ArtifactKind,
        source: ArtifactSource<'_>,
    ) -> Result<ArtifactRef, StoreError> {
        match source {
            ArtifactSource::Bytes { file_name, data } => self.put_bytes(kind, file_name, data).await,
            ArtifactSource::File(path) => self.put_file(kind, path).await,
            ArtifactSource::Directory(path) => self.put_directory(kind, path).await,
        }
    }

    async fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        let path = self.locate(artifact)?;
        if fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(StoreError::NotFound(artifact.clone()))
        }
    }
}

/// First 16 hex chars of the SHA-256 of `data`
fn hash_prefix(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

/// Sanitized `.ext` suffix of a file name, or empty
fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Copy a file while hashing it, returning the hash prefix
fn copy_and_hash(src: &Path, dst: &Path) -> std::io::Result<String> {
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        output.write_all(&buffer[..n])?;
    }
    output.sync_all()?;

    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..8]))
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn remove_entry(path: &Path) -> std::io::Result<()> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
