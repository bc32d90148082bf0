//! In-memory collaborators for pipeline tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::watch;

use super::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use super::resolver::{MetadataResolver, ResolverSettings};
use super::traits::{
    DownloadBackend, DownloadStatus, FeedSource, LlmExtraction, SeriesCatalog, SeriesCatalogEntry,
    StorageBackend, TaskHandle, TitleExtractor,
};
use crate::db::Db;
use crate::error::{FeedError, LlmError};
use crate::feed::FeedEntry;
use crate::notify::{Notification, Notifier};
use crate::retry::RetryConfig;

#[derive(Clone, Default)]
pub struct MockFeedSource {
    feeds: Arc<Mutex<HashMap<String, Vec<FeedEntry>>>>,
    down: Arc<Mutex<HashSet<String>>>,
}

impl MockFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entries(&self, url: &str, entries: Vec<FeedEntry>) {
        self.feeds.lock().unwrap().insert(url.to_string(), entries);
    }

    pub fn set_down(&self, url: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }
}

#[async_trait]
impl FeedSource for MockFeedSource {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FeedError> {
        if self.down.lock().unwrap().contains(url) {
            return Err(FeedError::Unreachable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.feeds.lock().unwrap().get(url).cloned().unwrap_or_default())
    }
}

/// Records dispatches; task status is scripted per entry id
#[derive(Clone, Default)]
pub struct MockDownloads {
    dispatched: Arc<Mutex<Vec<String>>>,
    statuses: Arc<Mutex<HashMap<String, DownloadStatus>>>,
    dispatch_failures: Arc<Mutex<u32>>,
    cleaned: Arc<Mutex<Vec<String>>>,
}

impl MockDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, entry_id: &str, status: DownloadStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(entry_id.to_string(), status);
    }

    /// Fail the next `n` dispatch calls
    pub fn fail_next_dispatches(&self, n: u32) {
        *self.dispatch_failures.lock().unwrap() = n;
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadBackend for MockDownloads {
    async fn dispatch(&self, entry_id: &str, _link: &str) -> Result<TaskHandle> {
        // widen the window for racing workers
        tokio::task::yield_now().await;
        {
            let mut failures = self.dispatch_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                bail!("backend unavailable");
            }
        }
        self.dispatched.lock().unwrap().push(entry_id.to_string());
        Ok(TaskHandle {
            task_id: entry_id.to_string(),
            staging_dir: format!("/downloads/{}", entry_id),
        })
    }

    async fn status(&self, handle: &TaskHandle) -> Result<DownloadStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&handle.task_id)
            .cloned()
            .unwrap_or(DownloadStatus::Pending))
    }

    async fn cleanup(&self, handle: &TaskHandle) -> Result<()> {
        self.cleaned.lock().unwrap().push(handle.staging_dir.clone());
        Ok(())
    }
}

/// Flat set of file paths; directories are implied
#[derive(Clone, Default)]
pub struct MockStorage {
    files: Arc<Mutex<HashSet<String>>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str) {
        self.files.lock().unwrap().insert(path.to_string());
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    async fn exists(&self, path: &str) -> Result<bool> {
        let files = self.files.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(files.contains(path) || files.iter().any(|f| f.starts_with(&prefix)))
    }

    async fn create_dir_all(&self, _dir: &str) -> Result<()> {
        Ok(())
    }

    async fn move_file(&self, source: &str, destination: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains(destination) {
            bail!("{} exists", destination);
        }
        if !files.remove(source) {
            bail!("{} missing", source);
        }
        files.insert(destination.to_string());
        Ok(())
    }
}

/// Scripted LLM replies keyed by raw title
#[derive(Clone, Default)]
pub struct MockExtractor {
    replies: Arc<Mutex<HashMap<String, Result<LlmExtraction, LlmError>>>>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reply(&self, raw_title: &str, reply: Result<LlmExtraction, LlmError>) {
        self.replies
            .lock()
            .unwrap()
            .insert(raw_title.to_string(), reply);
    }

    pub fn calls(&self, raw_title: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(raw_title)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl TitleExtractor for MockExtractor {
    async fn extract(&self, raw_title: &str) -> Result<LlmExtraction, LlmError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(raw_title.to_string())
            .or_default() += 1;

        self.replies
            .lock()
            .unwrap()
            .get(raw_title)
            .cloned()
            .unwrap_or_else(|| Err(LlmError::Schema(format!("no reply for {}", raw_title))))
    }
}

#[derive(Clone, Default)]
pub struct MockCatalog {
    entries: Arc<Mutex<Vec<SeriesCatalogEntry>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockCatalog {
    pub fn new(entries: Vec<SeriesCatalogEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
            failure: Arc::default(),
        }
    }

    pub fn fail_with(&self, error: &str) {
        *self.failure.lock().unwrap() = Some(error.to_string());
    }
}

#[async_trait]
impl SeriesCatalog for MockCatalog {
    async fn search(&self, _title: &str) -> Result<Vec<SeriesCatalogEntry>> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(anyhow!(error));
        }
        Ok(self.entries.lock().unwrap().clone())
    }
}

#[derive(Clone, Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}

pub const FEED_URL: &str = "https://feeds.example.com/anime.xml";
pub const LIBRARY: &str = "/anime";

/// A database plus one set of fakes, shared by any number of orchestrators
pub struct TestHarness {
    pub db: Db,
    pub feeds: MockFeedSource,
    pub downloads: MockDownloads,
    pub storage: MockStorage,
    pub llm: MockExtractor,
    pub catalog: MockCatalog,
    pub notifier: MockNotifier,
    pub settings: OrchestratorSettings,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            db: Db::open_in_memory().unwrap(),
            feeds: MockFeedSource::new(),
            downloads: MockDownloads::new(),
            storage: MockStorage::new(),
            llm: MockExtractor::new(),
            catalog: MockCatalog::new(Vec::new()),
            notifier: MockNotifier::new(),
            settings: OrchestratorSettings {
                feeds: vec![FEED_URL.to_string()],
                library_root: LIBRARY.to_string(),
                max_concurrent: 3,
                poll_interval: Duration::from_millis(5),
                download_timeout: Duration::from_secs(60),
                max_attempts: 3,
                feed_failure_limit: 2,
                retention_days: 180,
            },
        }
    }

    /// Build an orchestrator over the shared state, plus its shutdown switch
    pub fn orchestrator(&self) -> (Orchestrator, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let resolver = MetadataResolver::new(
            Arc::new(self.llm.clone()),
            Arc::new(self.catalog.clone()),
            ResolverSettings {
                retry: RetryConfig::new(2, Duration::from_millis(1)),
                ..Default::default()
            },
        );
        let collaborators = Collaborators {
            feeds: Arc::new(self.feeds.clone()),
            downloads: Arc::new(self.downloads.clone()),
            storage: Arc::new(self.storage.clone()),
            resolver: Arc::new(resolver),
            notifier: Arc::new(self.notifier.clone()),
        };
        let orchestrator = Orchestrator::new(self.db.clone(), collaborators, self.settings.clone(), rx);
        (orchestrator, tx)
    }

    /// Publish an entry and script a finished download and LLM reply for it
    pub fn publish(&self, id: &str, raw_title: &str, series: &str, episode: u32) -> String {
        let entry = FeedEntry {
            id: id.to_string(),
            raw_title: raw_title.to_string(),
            link: format!("magnet:?xt=urn:btih:{}", id),
            published_at: None,
        };
        let mut entries = self.feeds.feeds.lock().unwrap().get(FEED_URL).cloned().unwrap_or_default();
        entries.push(entry);
        self.feeds.set_entries(FEED_URL, entries);

        let path = format!("/downloads/{}/{}", id, raw_title);
        self.storage.add_file(&path);
        self.downloads
            .set_status(id, DownloadStatus::Complete { path: path.clone() });
        self.llm.set_reply(
            raw_title,
            Ok(LlmExtraction {
                series_title: series.to_string(),
                season: None,
                episode,
            }),
        );
        path
    }

    pub fn library_file(&self, series: &str, season: u32, filename: &str) -> String {
        format!("{}/{}/Season {}/{}", LIBRARY, series, season, filename)
    }
}
