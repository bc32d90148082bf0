//! Pipeline Orchestrator
//!
//! One cycle fetches every feed, records new entries, then advances every
//! active entry as far as it can go. Entries are processed concurrently; the
//! shared semaphore bounds how many steps run at once across all cycles.
//! All progress is persisted after each step, so a restarted process picks
//! up where the previous one stopped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::locks::{ClaimSet, KeyedLocks};
use super::planner::{self, PlanError};
use super::resolver::MetadataResolver;
use super::state::{EntryState, FailureReason};
use super::traits::{DownloadBackend, DownloadStatus, FeedSource, StorageBackend};
use crate::config::Config;
use crate::db::entries::{self, PipelineEntry};
use crate::db::models::DispatchStatus;
use crate::db::{Db, feeds, history, seen};
use crate::error::PipelineError;
use crate::notify::{Notification, Notifier};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub feeds: Vec<String>,
    pub library_root: String,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub download_timeout: Duration,
    /// Retryable failures allowed per state before an entry is failed
    pub max_attempts: u32,
    pub feed_failure_limit: u32,
    pub retention_days: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            feeds: config.rss.urls.clone(),
            library_root: config.openlist.library_root().to_string(),
            max_concurrent: config.pipeline.max_concurrent.max(1),
            poll_interval: config.pipeline.poll_interval(),
            download_timeout: config.pipeline.download_timeout(),
            max_attempts: config.pipeline.max_attempts.max(1),
            feed_failure_limit: config.pipeline.feed_failure_limit.max(1),
            retention_days: config.pipeline.retention_days,
        }
    }
}

/// External systems the orchestrator drives
pub struct Collaborators {
    pub feeds: Arc<dyn FeedSource>,
    pub downloads: Arc<dyn DownloadBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub resolver: Arc<MetadataResolver>,
    pub notifier: Arc<dyn Notifier>,
}

/// What one cycle did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub new_entries: usize,
    pub processed: usize,
}

/// Cheap to clone; clones share the worker pool and in-flight claims
#[derive(Clone)]
pub struct Orchestrator {
    db: Db,
    feeds: Arc<dyn FeedSource>,
    downloads: Arc<dyn DownloadBackend>,
    storage: Arc<dyn StorageBackend>,
    resolver: Arc<MetadataResolver>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<OrchestratorSettings>,
    claims: ClaimSet,
    locks: KeyedLocks,
    workers: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            feeds: collaborators.feeds,
            downloads: collaborators.downloads,
            storage: collaborators.storage,
            resolver: collaborators.resolver,
            notifier: collaborators.notifier,
            workers: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings: Arc::new(settings),
            claims: ClaimSet::default(),
            locks: KeyedLocks::default(),
            shutdown,
        }
    }

    /// Startup housekeeping before the first cycle
    ///
    /// Releases dispatch reservations that a crash left behind and unpauses
    /// every feed. Entries already dispatched keep their task handle and are
    /// polled again, never re-dispatched.
    pub async fn recover(&self) -> Result<()> {
        let (released, unpaused, resumable) = self
            .db
            .with_conn(|conn| {
                let released = seen::release_stale_reservations(conn)?;
                let unpaused = feeds::reset_pauses(conn)?;
                let resumable = entries::list_active(conn)?
                    .iter()
                    .filter(|e| e.state == EntryState::Dispatched)
                    .count();
                Ok((released, unpaused, resumable))
            })
            .await?;

        if released > 0 {
            warn!("Released {} dispatch reservation(s) left by an earlier run", released);
        }
        if unpaused > 0 {
            info!("Unpaused {} feed(s)", unpaused);
        }
        if resumable > 0 {
            info!("Resuming {} in-flight download(s)", resumable);
        }
        Ok(())
    }

    /// Run one pipeline cycle
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let new_entries = self.fetch_feeds().await;

        let active = self.db.with_conn(entries::list_active).await?;
        let mut tasks = JoinSet::new();
        for entry in active {
            // another cycle is already working on it
            let Some(claim) = self.claims.try_claim(&entry.entry_id) else {
                continue;
            };
            let this = self.clone();
            tasks.spawn(async move {
                let _claim = claim;
                let result = this.advance(&entry.entry_id).await;
                (entry.entry_id, result)
            });
        }

        let mut processed = 0;
        while let Some(joined) = tasks.join_next().await {
            processed += 1;
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((entry_id, Err(e))) => error!("Failed to advance entry {}: {:?}", entry_id, e),
                Err(e) => error!("Entry worker panicked: {:?}", e),
            }
        }

        self.prune().await;

        let summary = CycleSummary {
            new_entries,
            processed,
        };
        debug!("Cycle complete: {:?}", summary);
        Ok(summary)
    }

    /// Fetch all feeds and record unseen entries; returns how many were new
    async fn fetch_feeds(&self) -> usize {
        let mut new_entries = 0;
        for url in &self.settings.feeds {
            match self.fetch_feed(url).await {
                Ok(count) => new_entries += count,
                Err(e) => error!("Failed to process feed {}: {:?}", url, e),
            }
        }
        new_entries
    }

    async fn fetch_feed(&self, url: &str) -> Result<usize> {
        if self.db.with_conn(|conn| feeds::is_paused(conn, url)).await? {
            debug!("Feed {} is paused, skipping", url);
            return Ok(0);
        }

        let fetched = match self.feeds.fetch(url).await {
            Ok(entries) => entries,
            Err(e) => {
                let error = PipelineError::from(e).to_string();
                let limit = self.settings.feed_failure_limit;
                let paused = self
                    .db
                    .with_conn(|conn| feeds::record_failure(conn, url, &error, limit))
                    .await?;

                if paused {
                    let fatal = PipelineError::FatalConfig(format!("{} keeps failing: {}", url, error));
                    error!("Pausing feed: {}", fatal);
                    self.notifier
                        .notify(&Notification::FeedPaused {
                            url: url.to_string(),
                            error,
                        })
                        .await;
                } else {
                    warn!("{}, will retry next cycle", error);
                }
                return Ok(0);
            }
        };

        self.db
            .with_conn(|conn| {
                feeds::record_success(conn, url)?;
                let mut inserted = 0;
                for entry in &fetched {
                    if seen::is_seen(conn, &entry.id)? {
                        continue;
                    }
                    if entries::insert_fetched(conn, url, entry)? {
                        info!("New entry: {}", entry.raw_title);
                        inserted += 1;
                    }
                }
                Ok(inserted)
            })
            .await
    }

    /// Drive one entry forward until it blocks, fails or finishes
    async fn advance(&self, entry_id: &str) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            // re-read: the snapshot that scheduled us may be stale
            let Some(entry) = self
                .db
                .with_conn(|conn| entries::get_entry(conn, entry_id))
                .await?
            else {
                return Ok(());
            };

            let moved = match entry.state {
                EntryState::Fetched => self.dispatch(&entry).await?,
                EntryState::Dispatched => self.await_download(&entry).await?,
                EntryState::Downloaded => self.resolve(&entry).await?,
                EntryState::Resolved => self.rename(&entry).await?,
                EntryState::Renamed => self.notify_ready(&entry).await?,
                EntryState::Notified | EntryState::Failed => return Ok(()),
            };

            if !moved {
                return Ok(());
            }
        }
    }

    /// `Fetched -> Dispatched`
    ///
    /// The seen record is reserved before the backend is called; only the
    /// worker that wins the reservation dispatches.
    async fn dispatch(&self, entry: &PipelineEntry) -> Result<bool> {
        let id = entry.entry_id.as_str();
        if !self.db.with_conn(|conn| seen::try_reserve(conn, id)).await? {
            debug!("Entry {} already reserved, skipping dispatch", id);
            return Ok(false);
        }

        let result = {
            let _permit = self.workers.acquire().await.context("Worker pool closed")?;
            self.downloads.dispatch(id, &entry.link).await
        };

        match result {
            Ok(handle) => {
                self.db
                    .with_conn_mut(|conn| {
                        let tx = conn.transaction().context("Failed to start transaction")?;
                        seen::mark_seen(&tx, id, DispatchStatus::Success)?;
                        entries::record_dispatched(&tx, id, &handle)?;
                        tx.commit().context("Failed to commit dispatch")
                    })
                    .await?;
                info!("Dispatched '{}' as task {}", entry.raw_title, handle.task_id);
                Ok(true)
            }
            Err(e) => {
                let error = format!("{:#}", e);
                let attempts = self
                    .db
                    .with_conn(|conn| {
                        seen::mark_seen(conn, id, DispatchStatus::Failed)?;
                        entries::record_attempt_error(conn, id, &error)
                    })
                    .await?;

                if attempts >= self.settings.max_attempts {
                    self.db
                        .with_conn(|conn| seen::mark_seen(conn, id, DispatchStatus::Abandoned))
                        .await?;
                    self.fail(entry, EntryState::Fetched, FailureReason::RetriesExhausted, &error)
                        .await?;
                } else {
                    warn!(
                        "Dispatch of '{}' failed (attempt {}/{}): {}",
                        entry.raw_title, attempts, self.settings.max_attempts, error
                    );
                }
                Ok(false)
            }
        }
    }

    /// `Dispatched -> Downloaded`
    ///
    /// Polls the task until it settles. The worker sleeps between polls
    /// without holding a pool slot, and returns early on shutdown leaving the
    /// entry dispatched for the next run.
    async fn await_download(&self, entry: &PipelineEntry) -> Result<bool> {
        let Some(handle) = entry.task.clone() else {
            self.fail(
                entry,
                EntryState::Dispatched,
                FailureReason::DownloadFailed,
                "no task handle recorded",
            )
            .await?;
            return Ok(false);
        };

        let dispatched_at = entry.dispatched_at.unwrap_or_else(Utc::now);
        let mut shutdown = self.shutdown.clone();

        loop {
            let status = {
                let _permit = self.workers.acquire().await.context("Worker pool closed")?;
                self.downloads.status(&handle).await
            };

            match status {
                Ok(DownloadStatus::Complete { path }) => {
                    self.db
                        .with_conn(|conn| entries::record_downloaded(conn, &entry.entry_id, &path))
                        .await?;
                    info!("Downloaded '{}' to {}", entry.raw_title, path);
                    return Ok(true);
                }
                Ok(DownloadStatus::Failed { reason }) => {
                    self.fail(entry, EntryState::Dispatched, FailureReason::DownloadFailed, &reason)
                        .await?;
                    return Ok(false);
                }
                Ok(DownloadStatus::Pending) => {}
                Err(e) => warn!("Status check for task {} failed: {:?}", handle.task_id, e),
            }

            let elapsed = (Utc::now() - dispatched_at).to_std().unwrap_or_default();
            if elapsed >= self.settings.download_timeout {
                let detail = format!(
                    "download not finished after {}s",
                    self.settings.download_timeout.as_secs()
                );
                self.fail(entry, EntryState::Dispatched, FailureReason::Timeout, &detail)
                    .await?;
                return Ok(false);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("Shutting down, '{}' stays dispatched", entry.raw_title);
                    return Ok(false);
                }
            }
        }
    }

    /// `Downloaded -> Resolved`
    async fn resolve(&self, entry: &PipelineEntry) -> Result<bool> {
        let result = {
            let _permit = self.workers.acquire().await.context("Worker pool closed")?;
            self.resolver.resolve(&entry.raw_title).await
        };

        match result {
            Ok(resolved) => {
                self.db
                    .with_conn(|conn| entries::record_resolved(conn, &entry.entry_id, &resolved))
                    .await?;
                Ok(true)
            }
            Err(failure) if failure.is_retryable() => {
                self.count_attempt(entry, EntryState::Downloaded, &failure.to_string())
                    .await?;
                Ok(false)
            }
            Err(failure) => {
                let error = PipelineError::from(failure).to_string();
                self.fail(entry, EntryState::Downloaded, FailureReason::NeedsReview, &error)
                    .await?;
                Ok(false)
            }
        }
    }

    /// `Resolved -> Renamed`
    async fn rename(&self, entry: &PipelineEntry) -> Result<bool> {
        let (Some(resolved), Some(downloaded_path)) = (&entry.resolved, &entry.downloaded_path) else {
            self.fail(
                entry,
                EntryState::Resolved,
                FailureReason::NeedsReview,
                "resolved entry is missing its metadata or file",
            )
            .await?;
            return Ok(false);
        };

        let plan = planner::plan(resolved, downloaded_path, &self.settings.library_root);
        let result = {
            let _permit = self.workers.acquire().await.context("Worker pool closed")?;
            planner::apply(plan, self.storage.as_ref(), &self.locks).await
        };

        match result {
            Ok(applied) => {
                self.db
                    .with_conn_mut(|conn| {
                        let tx = conn.transaction().context("Failed to start transaction")?;
                        history::record_rename(&tx, &entry.entry_id, &applied, resolved)?;
                        entries::record_renamed(&tx, &entry.entry_id, &applied.destination_path)?;
                        tx.commit().context("Failed to commit rename")
                    })
                    .await?;

                if let Some(task) = &entry.task {
                    if let Err(e) = self.downloads.cleanup(task).await {
                        warn!("Failed to clean up {}: {:?}", task.staging_dir, e);
                    }
                }
                Ok(true)
            }
            Err(PlanError::Conflict { destination }) => {
                let error = PipelineError::DataConflict(format!("{} already exists", destination));
                self.fail(entry, EntryState::Resolved, FailureReason::Conflict, &error.to_string())
                    .await?;
                Ok(false)
            }
            Err(PlanError::Storage(e)) => {
                self.count_attempt(entry, EntryState::Resolved, &format!("{:#}", e))
                    .await?;
                Ok(false)
            }
        }
    }

    /// `Renamed -> Notified`; delivery problems never hold the entry back
    async fn notify_ready(&self, entry: &PipelineEntry) -> Result<bool> {
        if let Some(resolved) = &entry.resolved {
            self.notifier
                .notify(&Notification::EpisodeReady {
                    series_title: resolved.series_title.clone(),
                    season: resolved.season,
                    episode: resolved.episode,
                    raw_title: entry.raw_title.clone(),
                })
                .await;
        }

        self.db
            .with_conn(|conn| entries::record_notified(conn, &entry.entry_id))
            .await?;
        Ok(true)
    }

    /// Count a retryable error; fail the entry once attempts run out
    async fn count_attempt(&self, entry: &PipelineEntry, state: EntryState, error: &str) -> Result<()> {
        let attempts = self
            .db
            .with_conn(|conn| entries::record_attempt_error(conn, &entry.entry_id, error))
            .await?;

        if attempts >= self.settings.max_attempts {
            self.fail(entry, state, FailureReason::RetriesExhausted, error)
                .await
        } else {
            warn!(
                "'{}' stays {} (attempt {}/{}): {}",
                entry.raw_title, state, attempts, self.settings.max_attempts, error
            );
            Ok(())
        }
    }

    async fn fail(
        &self,
        entry: &PipelineEntry,
        from: EntryState,
        reason: FailureReason,
        detail: &str,
    ) -> Result<()> {
        self.db
            .with_conn(|conn| entries::record_failure(conn, &entry.entry_id, from, reason, detail))
            .await?;

        warn!("'{}' failed ({}): {}", entry.raw_title, reason, detail);
        self.notifier
            .notify(&Notification::EntryFailed {
                raw_title: entry.raw_title.clone(),
                reason,
                detail: detail.to_string(),
            })
            .await;
        Ok(())
    }

    async fn prune(&self) {
        let days = self.settings.retention_days;
        let result = self
            .db
            .with_conn(|conn| {
                let seen = seen::prune_older_than(conn, days)?;
                let finished = entries::prune_notified(conn, days)?;
                Ok((seen, finished))
            })
            .await;

        match result {
            Ok((0, 0)) => {}
            Ok((seen, finished)) => info!(
                "Pruned {} seen record(s) and {} finished entries older than {} days",
                seen, finished, days
            ),
            Err(e) => error!("Failed to prune old records: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entries::get_entry;
    use crate::db::seen::get_seen;
    use crate::error::LlmError;
    use crate::pipeline::mocks::{FEED_URL, MockCatalog, TestHarness};
    use crate::pipeline::traits::{LlmExtraction, SeriesCatalogEntry};

    const RAW: &str = "[Group] Great Show - 05 (1080p) [ABCDEF].mkv";

    async fn entry(h: &TestHarness, id: &str) -> PipelineEntry {
        h.db.with_conn(|conn| get_entry(conn, id)).await.unwrap().unwrap()
    }

    fn great_show_catalog(h: &mut TestHarness) {
        h.catalog = MockCatalog::new(vec![SeriesCatalogEntry {
            canonical_title: "Great Show".to_string(),
            known_aliases: vec!["Great Show".to_string()],
            season_count: 1,
        }]);
    }

    #[tokio::test]
    async fn test_happy_path_reaches_notified() {
        let mut h = TestHarness::new();
        great_show_catalog(&mut h);
        h.publish("ep5", RAW, "Great Show", 5);
        let (orchestrator, _shutdown) = h.orchestrator();

        let summary = orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.new_entries, 1);

        let done = entry(&h, "ep5").await;
        assert_eq!(done.state, EntryState::Notified);
        let destination = h.library_file("Great Show", 1, "Great Show S01E05.mkv");
        assert_eq!(done.destination_path.as_deref(), Some(destination.as_str()));
        assert!(h.storage.has_file(&destination));
        assert_eq!(h.downloads.cleaned(), vec!["/downloads/ep5".to_string()]);
        assert!(matches!(
            h.notifier.sent().as_slice(),
            [Notification::EpisodeReady { episode: 5, .. }]
        ));

        let record = h
            .db
            .with_conn(|conn| history::find_by_destination(conn, &destination))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.confidence, "llm_confirmed_by_db");
    }

    #[tokio::test]
    async fn test_consecutive_cycles_dispatch_once() {
        let h = TestHarness::new();
        h.publish("ep5", RAW, "Great Show", 5);
        let (orchestrator, _shutdown) = h.orchestrator();

        orchestrator.run_cycle().await.unwrap();
        let second = orchestrator.run_cycle().await.unwrap();

        assert_eq!(second.new_entries, 0);
        assert_eq!(h.downloads.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_dispatch_once() {
        let h = TestHarness::new();
        h.publish("ep5", RAW, "Great Show", 5);

        // separate orchestrators share nothing in memory, only the database
        let mut cycles = JoinSet::new();
        let mut switches = Vec::new();
        for _ in 0..8 {
            let (orchestrator, shutdown) = h.orchestrator();
            switches.push(shutdown);
            cycles.spawn(async move { orchestrator.run_cycle().await });
        }
        while let Some(result) = cycles.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(h.downloads.dispatched(), vec!["ep5".to_string()]);
        assert_eq!(entry(&h, "ep5").await.state, EntryState::Notified);
    }

    #[tokio::test]
    async fn test_restart_resumes_dispatched_entry() {
        let h = TestHarness::new();
        h.publish("ep5", RAW, "Great Show", 5);
        h.downloads.set_status("ep5", DownloadStatus::Pending);

        let (first, shutdown) = h.orchestrator();
        let cycle = tokio::spawn(async move { first.run_cycle().await });
        while entry(&h, "ep5").await.state != EntryState::Dispatched {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.send(true).unwrap();
        cycle.await.unwrap().unwrap();
        assert_eq!(entry(&h, "ep5").await.state, EntryState::Dispatched);

        // the download finishes while the process is down
        h.downloads.set_status(
            "ep5",
            DownloadStatus::Complete {
                path: format!("/downloads/ep5/{}", RAW),
            },
        );

        let (second, _shutdown) = h.orchestrator();
        second.recover().await.unwrap();
        second.run_cycle().await.unwrap();

        assert_eq!(h.downloads.dispatch_count(), 1);
        assert_eq!(entry(&h, "ep5").await.state, EntryState::Notified);
    }

    #[tokio::test]
    async fn test_unparsable_title_does_not_block_others() {
        let h = TestHarness::new();
        h.publish("ep5", RAW, "Great Show", 5);
        h.publish("bad", "[Group] ??? (1080p).mkv", "", 0);
        h.llm.set_reply(
            "[Group] ??? (1080p).mkv",
            Err(LlmError::Schema("missing episode".to_string())),
        );
        let (orchestrator, _shutdown) = h.orchestrator();

        orchestrator.run_cycle().await.unwrap();

        assert_eq!(entry(&h, "ep5").await.state, EntryState::Notified);
        let bad = entry(&h, "bad").await;
        assert_eq!(bad.state, EntryState::Failed);
        assert_eq!(bad.failure_reason, Some(FailureReason::NeedsReview));
        assert_eq!(bad.failed_from, Some(EntryState::Downloaded));
        assert!(h.notifier.sent().iter().any(|n| matches!(
            n,
            Notification::EntryFailed { reason: FailureReason::NeedsReview, .. }
        )));
    }

    #[tokio::test]
    async fn test_existing_destination_is_a_conflict() {
        let h = TestHarness::new();
        let source = h.publish("ep5", RAW, "Great Show", 5);
        let destination = h.library_file("Great Show", 1, "Great Show S01E05.mkv");
        h.storage.add_file(&destination);
        let (orchestrator, _shutdown) = h.orchestrator();

        orchestrator.run_cycle().await.unwrap();

        let parked = entry(&h, "ep5").await;
        assert_eq!(parked.state, EntryState::Failed);
        assert_eq!(parked.failure_reason, Some(FailureReason::Conflict));
        assert!(h.storage.has_file(&source));
        assert!(h.storage.has_file(&destination));
    }

    #[tokio::test]
    async fn test_download_timeout_fails_entry() {
        let mut h = TestHarness::new();
        h.settings.download_timeout = Duration::ZERO;
        h.publish("ep5", RAW, "Great Show", 5);
        h.downloads.set_status("ep5", DownloadStatus::Pending);
        let (orchestrator, _shutdown) = h.orchestrator();

        orchestrator.run_cycle().await.unwrap();

        let timed_out = entry(&h, "ep5").await;
        assert_eq!(timed_out.failure_reason, Some(FailureReason::Timeout));
        assert!(h.notifier.sent().iter().any(|n| matches!(
            n,
            Notification::EntryFailed { reason: FailureReason::Timeout, .. }
        )));
    }

    #[tokio::test]
    async fn test_dispatch_failures_retry_then_abandon() {
        let h = TestHarness::new();
        h.publish("ep5", RAW, "Great Show", 5);
        h.downloads.fail_next_dispatches(10);
        let (orchestrator, _shutdown) = h.orchestrator();

        orchestrator.run_cycle().await.unwrap();
        let retrying = entry(&h, "ep5").await;
        assert_eq!(retrying.state, EntryState::Fetched);
        assert_eq!(retrying.attempts, 1);
        let record = h.db.with_conn(|conn| get_seen(conn, "ep5")).await.unwrap().unwrap();
        assert_eq!(record.dispatch_status, DispatchStatus::Failed);

        // max_attempts is 3 in the harness
        orchestrator.run_cycle().await.unwrap();
        orchestrator.run_cycle().await.unwrap();

        let abandoned = entry(&h, "ep5").await;
        assert_eq!(abandoned.state, EntryState::Failed);
        assert_eq!(abandoned.failure_reason, Some(FailureReason::RetriesExhausted));
        let record = h.db.with_conn(|conn| get_seen(conn, "ep5")).await.unwrap().unwrap();
        assert_eq!(record.dispatch_status, DispatchStatus::Abandoned);

        // a later cycle neither re-inserts nor re-dispatches it
        orchestrator.run_cycle().await.unwrap();
        assert_eq!(h.downloads.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_outage_keeps_entry_downloaded() {
        let h = TestHarness::new();
        h.publish("ep5", RAW, "Great Show", 5);
        h.llm.set_reply(RAW, Err(LlmError::Transient("timeout".to_string())));
        let (orchestrator, _shutdown) = h.orchestrator();

        orchestrator.run_cycle().await.unwrap();
        let waiting = entry(&h, "ep5").await;
        assert_eq!(waiting.state, EntryState::Downloaded);
        assert_eq!(waiting.attempts, 1);

        h.llm.set_reply(
            RAW,
            Ok(LlmExtraction {
                series_title: "Great Show".to_string(),
                season: None,
                episode: 5,
            }),
        );
        orchestrator.run_cycle().await.unwrap();
        assert_eq!(entry(&h, "ep5").await.state, EntryState::Notified);
    }

    #[tokio::test]
    async fn test_failing_feed_is_paused() {
        let h = TestHarness::new();
        h.feeds.set_down(FEED_URL, true);
        let (orchestrator, _shutdown) = h.orchestrator();

        // feed_failure_limit is 2 in the harness
        orchestrator.run_cycle().await.unwrap();
        orchestrator.run_cycle().await.unwrap();
        orchestrator.run_cycle().await.unwrap();

        let paused: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|n| matches!(n, Notification::FeedPaused { .. }))
            .collect();
        assert_eq!(paused.len(), 1);
        assert!(h.db.with_conn(|conn| feeds::is_paused(conn, FEED_URL)).await.unwrap());

        // a paused feed is not fetched even once it recovers
        h.feeds.set_down(FEED_URL, false);
        h.publish("ep6", "[Group] Great Show - 06 (1080p).mkv", "Great Show", 6);
        assert_eq!(orchestrator.run_cycle().await.unwrap().new_entries, 0);

        orchestrator.recover().await.unwrap();
        assert_eq!(orchestrator.run_cycle().await.unwrap().new_entries, 1);
    }
}
