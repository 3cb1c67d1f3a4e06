//! Directory checks performed before a request reaches the engine.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backup::SyncRequest;

/// Validates a source/target pair the way a directory picker would:
/// both absolute, existing directories, source readable, target writable.
pub async fn verify_request(source: &str, target: &str) -> Result<SyncRequest> {
    let source = PathBuf::from(source.trim());
    let target = PathBuf::from(target.trim());

    verify_readable_dir(&source).await?;
    verify_writable_dir(&target).await?;

    let request = SyncRequest::new(source, target)?;
    let canonical_source = tokio::fs::canonicalize(&request.source).await?;
    let canonical_target = tokio::fs::canonicalize(&request.target).await?;
    if canonical_source == canonical_target {
        bail!("source and target resolve to the same directory: {}", canonical_source.display());
    }
    if canonical_target.starts_with(&canonical_source) {
        bail!(
            "target {} is inside source {}",
            canonical_target.display(),
            canonical_source.display()
        );
    }

    Ok(request)
}

pub async fn verify_readable_dir(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        bail!("path must be absolute: {}", path.display());
    }
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("source does not exist: {}", path.display()))?;
    if !metadata.is_dir() {
        bail!("source is not a directory: {}", path.display());
    }
    tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("source is not readable: {}", path.display()))?;
    Ok(())
}

/// Proves the directory is writable by creating and removing a probe file.
pub async fn verify_writable_dir(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        bail!("path must be absolute: {}", path.display());
    }
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("target does not exist: {}", path.display()))?;
    if !metadata.is_dir() {
        bail!("target is not a directory: {}", path.display());
    }

    let probe = path.join(format!(".mirror-guard-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&probe, b"")
        .await
        .with_context(|| format!("target is not writable: {}", path.display()))?;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        debug!("Failed to remove probe file {}: {}", probe.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_str(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[tokio::test]
    async fn accepts_existing_distinct_directories() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let request = verify_request(as_str(source.path()), as_str(target.path())).await.unwrap();
        assert_eq!(request.source, source.path());
        assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn rejects_missing_relative_and_nested_paths() {
        let source = tempfile::tempdir().unwrap();
        let missing = source.path().join("missing");
        let nested = source.path().join("nested");
        std::fs::create_dir(&nested).unwrap();

        assert!(verify_request(as_str(source.path()), as_str(&missing)).await.is_err());
        assert!(verify_request("relative/dir", as_str(source.path())).await.is_err());
        assert!(verify_request(as_str(source.path()), as_str(source.path())).await.is_err());
        assert!(verify_request(as_str(source.path()), as_str(&nested)).await.is_err());
    }

    #[tokio::test]
    async fn rejects_file_as_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(verify_readable_dir(&file).await.is_err());
        assert!(verify_writable_dir(&file).await.is_err());
    }
}
