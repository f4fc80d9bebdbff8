//! On-demand segmentation of local sources.
//!
//! When a session is requested for a source that has no DASH manifest yet,
//! the relay shells out to an operator-provided segmentation script which
//! packages the source and writes the manifest. The script contract is
//! `sh <script> <name> <source> <manifest-path>`; success means the manifest
//! file exists afterwards.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::session::SessionError;

/// Runs the external segmentation tool for one source.
#[derive(Debug, Clone)]
pub struct Segmenter {
    script_path: PathBuf,
}

impl Segmenter {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
        }
    }

    /// Segments `source` and produces a manifest at `manifest_path`.
    ///
    /// # Errors
    /// - `SessionError::ToolInvocation` - script failed, or exited
    ///   successfully without producing the manifest
    pub async fn generate_manifest(
        &self,
        name: &str,
        source: &str,
        manifest_path: &Path,
    ) -> Result<(), SessionError> {
        if let Some(parent) = manifest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(
            script = %self.script_path.display(),
            name,
            source,
            "running segmentation tool"
        );

        let output = Command::new("sh")
            .arg(&self.script_path)
            .arg(name)
            .arg(source)
            .arg(manifest_path)
            .output()
            .await
            .map_err(|e| SessionError::ToolInvocation {
                reason: format!("failed to spawn {}: {e}", self.script_path.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SessionError::ToolInvocation {
                reason: format!(
                    "script exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        // The script owns the output layout; all the relay verifies is that
        // the manifest it will serve actually materialized.
        if !tokio::fs::try_exists(manifest_path).await.unwrap_or(false) {
            return Err(SessionError::ToolInvocation {
                reason: format!(
                    "script succeeded but {} was not created",
                    manifest_path.display()
                ),
            });
        }

        tracing::info!(manifest = %manifest_path.display(), "manifest generated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("segment.sh");
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_successful_script_produces_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/bin/sh\necho '<MPD/>' > \"$3\"\n").await;
        let manifest = dir.path().join("out/live.mpd");

        let segmenter = Segmenter::new(&script);
        segmenter
            .generate_manifest("cam-7", "/media/cam-7.mp4", &manifest)
            .await
            .unwrap();

        assert!(manifest.exists());
    }

    #[tokio::test]
    async fn test_failing_script_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/bin/sh\necho 'no codec' >&2\nexit 3\n").await;

        let segmenter = Segmenter::new(&script);
        let result = segmenter
            .generate_manifest("cam-7", "src", &dir.path().join("live.mpd"))
            .await;

        match result {
            Err(SessionError::ToolInvocation { reason }) => {
                assert!(reason.contains("no codec"), "got: {reason}");
            }
            other => panic!("expected ToolInvocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_script_without_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/bin/sh\nexit 0\n").await;

        let segmenter = Segmenter::new(&script);
        let result = segmenter
            .generate_manifest("cam-7", "src", &dir.path().join("live.mpd"))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::ToolInvocation { .. })
        ));
    }
}
