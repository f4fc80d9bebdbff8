//! Local persistence of retrieved media artifacts.
//!
//! Everything the relay retrieves (manifests, initialization segments, media
//! segments) lands under one base directory, laid out per session. Writes go
//! through `tokio::fs` so retrieval tasks never block the runtime on disk.

use std::path::{Component, Path, PathBuf};

use crate::session::SessionId;

/// Errors from media persistence.
#[derive(Debug, thiserror::Error)]
pub enum MediaStoreError {
    #[error("Artifact name escapes the session directory: {name}")]
    UnsafeName { name: String },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes retrieved artifacts under `<base>/<session-id>/`.
///
/// Cheap to clone; clones share the same base directory.
#[derive(Debug, Clone)]
pub struct MediaStore {
    base_path: PathBuf,
}

impl MediaStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// The directory a session's artifacts live in.
    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.base_path.join(session.as_str())
    }

    /// Absolute path an artifact would be written to.
    ///
    /// # Errors
    /// - `MediaStoreError::UnsafeName` - name is absolute or walks upward
    pub fn artifact_path(
        &self,
        session: &SessionId,
        name: &str,
    ) -> Result<PathBuf, MediaStoreError> {
        let relative = Path::new(name);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir));
        if escapes {
            return Err(MediaStoreError::UnsafeName {
                name: name.to_string(),
            });
        }
        Ok(self.session_dir(session).join(relative))
    }

    /// Persists one artifact, creating parent directories as needed.
    ///
    /// Segment names may carry subdirectories (template patterns like
    /// `$RepresentationID$/...`), so the parent is derived per artifact.
    ///
    /// # Errors
    /// - `MediaStoreError::UnsafeName` / `CreateDir` / `Write`
    pub async fn persist(
        &self,
        session: &SessionId,
        name: &str,
        data: &[u8],
    ) -> Result<PathBuf, MediaStoreError> {
        let path = self.artifact_path(session, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MediaStoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| MediaStoreError::Write {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "artifact persisted");
        Ok(path)
    }

    /// Removes a session's directory and everything under it.
    ///
    /// A directory that never materialized is not an error.
    pub async fn purge_session(&self, session: &SessionId) -> Result<(), MediaStoreError> {
        let dir = self.session_dir(session);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(path = %dir.display(), "session artifacts purged");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MediaStoreError::Remove { path: dir, source }),
        }
    }
}
