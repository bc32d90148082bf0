//! Collaborator seams used by the pipeline
//!
//! Each external system is reached through one of these traits so the
//! orchestrator can be driven by in-memory fakes in tests.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, LlmError};
use crate::feed::FeedEntry;

/// Source of feed documents
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Entries of one feed ordered oldest to newest
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FeedError>;
}

/// Handle to an offline-download task, persisted with the entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    /// Private directory the backend downloads into
    pub staging_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Complete { path: String },
    Failed { reason: String },
}

/// Offline-download backend
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    /// Submit a link; `entry_id` keys the staging location
    async fn dispatch(&self, entry_id: &str, link: &str) -> Result<TaskHandle>;

    async fn status(&self, handle: &TaskHandle) -> Result<DownloadStatus>;

    /// Remove whatever the task left behind after the file was moved out
    async fn cleanup(&self, handle: &TaskHandle) -> Result<()>;
}

/// Storage holding the media library
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn create_dir_all(&self, dir: &str) -> Result<()>;

    /// Move a file; must fail rather than replace an existing destination
    async fn move_file(&self, source: &str, destination: &str) -> Result<()>;
}

/// Structured fields pulled out of a release title by the LLM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmExtraction {
    pub series_title: String,
    pub season: Option<u32>,
    pub episode: u32,
}

#[async_trait]
pub trait TitleExtractor: Send + Sync {
    async fn extract(&self, raw_title: &str) -> Result<LlmExtraction, LlmError>;
}

/// Read-only catalog record used for disambiguation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesCatalogEntry {
    pub canonical_title: String,
    pub known_aliases: Vec<String>,
    pub season_count: u32,
}

#[async_trait]
pub trait SeriesCatalog: Send + Sync {
    /// Zero or more candidates, best first
    async fn search(&self, title: &str) -> Result<Vec<SeriesCatalogEntry>>;
}
