//! Rename Planner
//!
//! Turns a resolved episode into a library path and moves the downloaded
//! file there. An existing destination is never overwritten.

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;

use super::locks::KeyedLocks;
use super::resolver::ResolvedEpisode;
use super::traits::StorageBackend;

const DEFAULT_EXTENSION: &str = ".mp4";

/// Source to destination mapping for one downloaded artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenamePlan {
    pub source_path: String,
    pub destination_path: String,
    pub applied: bool,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("destination {destination} already exists")]
    Conflict { destination: String },
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Join a directory and a name with exactly one `/`
pub fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Split a path into its parent directory and final component
///
/// ```ignore
/// assert_eq!(split_path("/anime/a.mkv"), ("/anime", "a.mkv"));
/// assert_eq!(split_path("/a.mkv"), ("/", "a.mkv"));
/// ```
pub fn split_path(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

/// Extension of the last path component including the dot, if any
fn extension(path: &str) -> Option<&str> {
    let (_, name) = split_path(path);
    match name.rfind('.') {
        Some(i) if i > 0 && i + 1 < name.len() => Some(&name[i..]),
        _ => None,
    }
}

/// Make a series title safe to use as a file and directory name
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
                ' '
            } else {
                c
            }
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches('.').trim_end();

    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{title} S{season:02}E{episode:02}{ext}`
pub fn episode_filename(resolved: &ResolvedEpisode, ext: &str) -> String {
    format!(
        "{} S{:02}E{:02}{}",
        sanitize_title(&resolved.series_title),
        resolved.season,
        resolved.episode,
        ext
    )
}

/// Build the plan for a downloaded file
///
/// # Arguments
///
/// * `resolved` - Series, season and episode for the file
/// * `downloaded_path` - Where the download backend left the file
/// * `library_root` - Root of the media library
///
/// # Returns
///
/// A plan targeting `{library_root}/{title}/Season {n}/{filename}`, not yet applied.
pub fn plan(resolved: &ResolvedEpisode, downloaded_path: &str, library_root: &str) -> RenamePlan {
    let ext = extension(downloaded_path).unwrap_or(DEFAULT_EXTENSION);
    let series_dir = join_path(library_root, &sanitize_title(&resolved.series_title));
    let season_dir = join_path(&series_dir, &format!("Season {}", resolved.season));

    RenamePlan {
        source_path: downloaded_path.to_string(),
        destination_path: join_path(&season_dir, &episode_filename(resolved, ext)),
        applied: false,
    }
}

/// Apply a plan against the storage backend
///
/// Holds the per-destination lock for the whole check-and-move. A destination
/// that exists while the source is gone is a move that already happened on an
/// earlier attempt and counts as applied.
pub async fn apply(
    plan: RenamePlan,
    storage: &dyn StorageBackend,
    locks: &KeyedLocks,
) -> Result<RenamePlan, PlanError> {
    if plan.applied {
        return Ok(plan);
    }

    let _guard = locks.lock(&plan.destination_path).await;

    if storage.exists(&plan.destination_path).await? {
        if storage.exists(&plan.source_path).await? {
            return Err(PlanError::Conflict {
                destination: plan.destination_path,
            });
        }
        tracing::info!("{} already in place", plan.destination_path);
        return Ok(RenamePlan {
            applied: true,
            ..plan
        });
    }

    let (dir, _) = split_path(&plan.destination_path);
    storage.create_dir_all(dir).await?;
    storage
        .move_file(&plan.source_path, &plan.destination_path)
        .await?;

    tracing::info!("Moved {} -> {}", plan.source_path, plan.destination_path);
    Ok(RenamePlan {
        applied: true,
        ..plan
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::local::LocalStorage;
    use crate::pipeline::resolver::ConfidenceSource;

    fn great_show() -> ResolvedEpisode {
        ResolvedEpisode {
            series_title: "Great Show".to_string(),
            season: 1,
            episode: 5,
            confidence: ConfidenceSource::LlmConfirmedByDb,
        }
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/anime/", "Great Show"), "/anime/Great Show");
        assert_eq!(join_path("/", "a.mkv"), "/a.mkv");
        assert_eq!(split_path("/anime/Great Show/a.mkv"), ("/anime/Great Show", "a.mkv"));
        assert_eq!(split_path("/a.mkv"), ("/", "a.mkv"));
        assert_eq!(split_path("a.mkv"), ("/", "a.mkv"));
        assert_eq!(extension("/dl/[Group] Show - 05 [ABCDEF].mkv"), Some(".mkv"));
        assert_eq!(extension("/dl/.hidden"), None);
        assert_eq!(extension("/dl/noext"), None);
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("Re:Zero"), "Re Zero");
        assert_eq!(sanitize_title("Fate/stay night"), "Fate stay night");
        assert_eq!(sanitize_title("  What?  Why*  "), "What Why");
        assert_eq!(sanitize_title("Show..."), "Show");
        assert_eq!(sanitize_title("???"), "Untitled");
    }

    #[test]
    fn test_plan_layout() {
        let plan = plan(
            &great_show(),
            "/downloads/0123456789abcdef/[Group] Great Show - 05 (1080p) [ABCDEF].mkv",
            "/anime",
        );
        assert_eq!(
            plan.destination_path,
            "/anime/Great Show/Season 1/Great Show S01E05.mkv"
        );
        assert!(!plan.applied);
    }

    #[test]
    fn test_plan_defaults_extension() {
        let mut resolved = great_show();
        resolved.season = 0;
        resolved.episode = 112;
        let plan = plan(&resolved, "/downloads/x/release", "/anime");
        assert_eq!(plan.destination_path, "/anime/Great Show/Season 0/Great Show S00E112.mp4");
    }

    #[tokio::test]
    async fn test_apply_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let source = join_path(root, "download.mkv");
        std::fs::write(&source, b"episode").unwrap();

        let plan = plan(&great_show(), &source, &join_path(root, "library"));
        let applied = apply(plan, &LocalStorage::default(), &KeyedLocks::default()).await.unwrap();

        assert!(applied.applied);
        assert_eq!(std::fs::read(&applied.destination_path).unwrap(), b"episode");
        assert!(!std::path::Path::new(&source).exists());
    }

    #[tokio::test]
    async fn test_apply_conflict_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let source = join_path(root, "download.mkv");
        std::fs::write(&source, b"new").unwrap();

        let plan = plan(&great_show(), &source, &join_path(root, "library"));
        let (season_dir, _) = split_path(&plan.destination_path);
        std::fs::create_dir_all(season_dir).unwrap();
        std::fs::write(&plan.destination_path, b"old").unwrap();

        let destination = plan.destination_path.clone();
        let result = apply(plan, &LocalStorage::default(), &KeyedLocks::default()).await;

        assert!(matches!(result, Err(PlanError::Conflict { .. })));
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
        assert_eq!(std::fs::read(&source).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_after_move() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let source = join_path(root, "download.mkv");
        std::fs::write(&source, b"episode").unwrap();

        let locks = KeyedLocks::default();
        let plan = plan(&great_show(), &source, &join_path(root, "library"));
        apply(plan.clone(), &LocalStorage::default(), &locks).await.unwrap();

        // a retry after a crash that happened before the state was saved
        let again = apply(plan, &LocalStorage::default(), &locks).await.unwrap();
        assert!(again.applied);
    }
}
