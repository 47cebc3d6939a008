//! Filesystem helpers for run artifacts and scratch space.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// What happened when a scratch directory was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Removed,
    NotPresent,
    /// Removal failed; the directory may still be on disk.
    Degraded { path: PathBuf, reason: String },
}

impl CleanupOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Move a file from `src` to `dst`, falling back to copy and delete when
/// the two are on different filesystems.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            tracing::debug!(
                "Cross-device rename, copying instead: {} -> {}",
                src.display(),
                dst.display()
            );
            copy_and_delete(src, dst).await
        }
        Err(e) => Err(MediaError::from(e)),
    }
}

/// EXDEV on Linux and macOS.
fn is_cross_device_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}

async fn copy_and_delete(src: &Path, dst: &Path) -> MediaResult<()> {
    // Same directory as dst keeps the final rename on one filesystem.
    let tmp_dst = dst.with_extension("tmp");

    fs::copy(src, &tmp_dst).await.map_err(|e| {
        tracing::error!(
            "Failed to copy {} -> {}: {}",
            src.display(),
            tmp_dst.display(),
            e
        );
        MediaError::from(e)
    })?;

    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(MediaError::from(e));
    }

    if let Err(e) = fs::remove_file(src).await {
        tracing::warn!(
            "Failed to remove {} after cross-device move: {}",
            src.display(),
            e
        );
    }

    Ok(())
}

/// Fail unless `path` is a regular file with at least one byte.
pub async fn ensure_non_empty_file(path: impl AsRef<Path>) -> MediaResult<u64> {
    let path = path.as_ref();
    let metadata = match fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MediaError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_file() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }
    if metadata.len() == 0 {
        return Err(MediaError::EmptyFile(path.to_path_buf()));
    }
    Ok(metadata.len())
}

/// Non-empty regular file check that never fails.
pub async fn is_non_empty_file(path: impl AsRef<Path>) -> bool {
    ensure_non_empty_file(path).await.is_ok()
}

/// Remove a directory tree, reporting failure as a value.
pub async fn remove_dir_best_effort(path: impl AsRef<Path>) -> CleanupOutcome {
    let path = path.as_ref();
    match fs::remove_dir_all(path).await {
        Ok(()) => CleanupOutcome::Removed,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CleanupOutcome::NotPresent,
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
            CleanupOutcome::Degraded {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    }
}

/// Remove a single file, ignoring "not found".
pub async fn remove_file_best_effort(path: impl AsRef<Path>) -> CleanupOutcome {
    let path = path.as_ref();
    match fs::remove_file(path).await {
        Ok(()) => CleanupOutcome::Removed,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CleanupOutcome::NotPresent,
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
            CleanupOutcome::Degraded {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_move_file_to_subdirectory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("result_voice.mp4");
        let dst = dir.path().join("out").join("run-1").join("result_voice.mp4");

        fs::write(&src, b"video bytes").await.unwrap();
        move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"video bytes");
    }

    #[tokio::test]
    async fn test_move_file_overwrites_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("new.mp4");
        let dst = dir.path().join("old.mp4");

        fs::write(&src, b"new").await.unwrap();
        fs::write(&dst, b"old").await.unwrap();
        move_file(&src, &dst).await.unwrap();

        assert_eq!(fs::read_to_string(&dst).await.unwrap(), "new");
    }

    #[test]
    fn test_is_cross_device_error() {
        assert!(is_cross_device_error(&std::io::Error::from_raw_os_error(18)));
        assert!(!is_cross_device_error(&std::io::Error::from_raw_os_error(2)));
    }

    #[tokio::test]
    async fn test_ensure_non_empty_file() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.wav");
        let full = dir.path().join("full.wav");
        fs::write(&empty, b"").await.unwrap();
        fs::write(&full, b"RIFF").await.unwrap();

        assert!(matches!(
            ensure_non_empty_file(dir.path().join("missing.wav")).await,
            Err(MediaError::FileNotFound(_))
        ));
        assert!(matches!(
            ensure_non_empty_file(&empty).await,
            Err(MediaError::EmptyFile(_))
        ));
        assert!(matches!(
            ensure_non_empty_file(dir.path()).await,
            Err(MediaError::FileNotFound(_))
        ));
        assert_eq!(ensure_non_empty_file(&full).await.unwrap(), 4);
        assert!(is_non_empty_file(&full).await);
    }

    #[tokio::test]
    async fn test_remove_dir_best_effort() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(scratch.join("nested")).await.unwrap();
        fs::write(scratch.join("nested").join("face.mp4"), b"x").await.unwrap();

        assert_eq!(remove_dir_best_effort(&scratch).await, CleanupOutcome::Removed);
        assert!(!scratch.exists());
        assert_eq!(remove_dir_best_effort(&scratch).await, CleanupOutcome::NotPresent);
    }

    #[tokio::test]
    async fn test_remove_dir_on_a_file_is_degraded() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not_a_dir");
        fs::write(&file, b"x").await.unwrap();

        let outcome = remove_dir_best_effort(&file).await;
        assert!(outcome.is_degraded(), "{:?}", outcome);
    }
}
