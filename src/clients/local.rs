//! Local filesystem storage, for libraries mounted on this host
//!
//! Paths handed to the backend are the OpenList paths the pipeline works
//! with; they are resolved under `root`, the directory where the OpenList
//! storage is mounted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::pipeline::traits::StorageBackend;

/// Suffix of the copy made when source and library are on different filesystems
const PARTIAL_SUFFIX: &str = ".anifeed-part";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new("/")
    }
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Put `destination` in place without ever replacing an existing file
    async fn place(source: &Path, destination: &Path) -> Result<()> {
        match tokio::fs::hard_link(source, destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("Destination {} already exists", destination.display())
            }
            Err(e) if matches!(e.kind(), ErrorKind::CrossesDevices | ErrorKind::Unsupported) => {
                tracing::debug!(
                    "Cannot link {} into {}, copying instead",
                    source.display(),
                    destination.display()
                );
                Self::copy_into_place(source, destination).await
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to link {} to {}", source.display(), destination.display())
            }),
        }
    }

    /// Copy next to the destination, then link the finished copy into place
    async fn copy_into_place(source: &Path, destination: &Path) -> Result<()> {
        let mut partial = destination.as_os_str().to_owned();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        tokio::fs::copy(source, &partial)
            .await
            .with_context(|| format!("Failed to copy {} to {}", source.display(), partial.display()))?;

        let linked = tokio::fs::hard_link(&partial, destination).await;
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            tracing::warn!("Failed to remove {}: {:?}", partial.display(), e);
        }
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("Destination {} already exists", destination.display())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to place {}", destination.display())),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn exists(&self, path: &str) -> Result<bool> {
        let path = self.resolve(path);
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))
    }

    async fn create_dir_all(&self, dir: &str) -> Result<()> {
        let dir = self.resolve(dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))
    }

    /// The file ends up in exactly one place: if the source cannot be
    /// removed, the new destination is removed again and the move fails.
    async fn move_file(&self, source: &str, destination: &str) -> Result<()> {
        let source = self.resolve(source);
        let destination = self.resolve(destination);

        Self::place(&source, &destination).await?;

        if let Err(e) = tokio::fs::remove_file(&source).await {
            if let Err(undo) = tokio::fs::remove_file(&destination).await {
                tracing::error!(
                    "Failed to undo partial move, {} is now also at {}: {:?}",
                    source.display(),
                    destination.display(),
                    undo
                );
            }
            return Err(e).with_context(|| format!("Failed to remove {} after moving", source.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mkv");
        let destination = dir.path().join("sub").join("b.mkv");
        std::fs::write(&source, b"episode").unwrap();

        let storage = LocalStorage::default();
        storage
            .create_dir_all(destination.parent().unwrap().to_str().unwrap())
            .await
            .unwrap();
        storage
            .move_file(source.to_str().unwrap(), destination.to_str().unwrap())
            .await
            .unwrap();

        assert!(!storage.exists(source.to_str().unwrap()).await.unwrap());
        assert_eq!(std::fs::read(&destination).unwrap(), b"episode");
    }

    #[tokio::test]
    async fn test_move_never_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mkv");
        let destination = dir.path().join("b.mkv");
        std::fs::write(&source, b"new").unwrap();
        std::fs::write(&destination, b"old").unwrap();

        let result = LocalStorage::default()
            .move_file(source.to_str().unwrap(), destination.to_str().unwrap())
            .await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
        assert_eq!(std::fs::read(&source).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_paths_resolve_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("downloads/abc")).unwrap();
        std::fs::write(dir.path().join("downloads/abc/ep.mkv"), b"episode").unwrap();

        let storage = LocalStorage::new(dir.path());
        assert!(storage.exists("/downloads/abc/ep.mkv").await.unwrap());

        storage.create_dir_all("/anime/Great Show/Season 1").await.unwrap();
        storage
            .move_file("/downloads/abc/ep.mkv", "/anime/Great Show/Season 1/Great Show S01E05.mkv")
            .await
            .unwrap();

        assert!(!storage.exists("/downloads/abc/ep.mkv").await.unwrap());
        assert_eq!(
            std::fs::read(dir.path().join("anime/Great Show/Season 1/Great Show S01E05.mkv")).unwrap(),
            b"episode"
        );
    }

    #[tokio::test]
    async fn test_copy_fallback_never_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mkv");
        let destination = dir.path().join("b.mkv");
        std::fs::write(&source, b"new").unwrap();
        std::fs::write(&destination, b"old").unwrap();

        let result = LocalStorage::copy_into_place(&source, &destination).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
        assert!(!dir.path().join("b.mkv.anifeed-part").exists());
    }

    #[tokio::test]
    async fn test_copy_fallback_places_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mkv");
        let destination = dir.path().join("b.mkv");
        std::fs::write(&source, b"episode").unwrap();

        LocalStorage::copy_into_place(&source, &destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"episode");
        assert!(!dir.path().join("b.mkv.anifeed-part").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_source_removal_is_rolled_back() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let library = dir.path().join("library");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&library).unwrap();
        let source = staging.join("a.mkv");
        let destination = library.join("b.mkv");
        std::fs::write(&source, b"episode").unwrap();

        // a read-only directory refuses the unlink of the source
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o555)).unwrap();
        let locked = std::fs::File::create(staging.join("write-check")).is_err();

        let result = LocalStorage::default()
            .move_file(source.to_str().unwrap(), destination.to_str().unwrap())
            .await;
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).unwrap();

        if !locked {
            // running as root, permissions are not enforced
            return;
        }
        assert!(result.is_err());
        assert!(source.exists());
        assert!(!destination.exists());
    }
}
