//! Persisted per-entry pipeline state
//!
//! Every transition is a conditional UPDATE on the expected current state,
//! so a stale worker can never move an entry that someone else already moved.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::feed::FeedEntry;
use crate::pipeline::resolver::{ConfidenceSource, ResolvedEpisode};
use crate::pipeline::state::{EntryState, FailureReason};
use crate::pipeline::traits::TaskHandle;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineEntry {
    pub entry_id: String,
    pub feed_url: String,
    pub raw_title: String,
    pub link: String,
    pub published_at: Option<String>,
    pub state: EntryState,
    pub failure_reason: Option<FailureReason>,
    pub failed_from: Option<EntryState>,
    pub task: Option<TaskHandle>,
    pub downloaded_path: Option<String>,
    pub resolved: Option<ResolvedEpisode>,
    pub destination_path: Option<String>,
    /// Failed attempts in the current state
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: String,
    pub updated_at: String,
}

const SELECT_COLUMNS: &str = "entry_id, feed_url, raw_title, link, published_at, state,
    failure_reason, failed_from, task_handle, downloaded_path, series_title, season, episode,
    confidence, destination_path, attempts, last_error, dispatched_at, created_at, updated_at";

/// Insert a freshly fetched entry; returns false if it was already known
pub fn insert_fetched(conn: &Connection, feed_url: &str, entry: &FeedEntry) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO pipeline_entries (entry_id, feed_url, raw_title, link, published_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 'fetched')",
            params![
                entry.id,
                feed_url,
                entry.raw_title,
                entry.link,
                entry.published_at.map(|t| t.to_rfc3339())
            ],
        )
        .with_context(|| format!("Failed to insert entry {}", entry.id))?;

    Ok(inserted == 1)
}

pub fn get_entry(conn: &Connection, entry_id: &str) -> Result<Option<PipelineEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM pipeline_entries WHERE entry_id = ?1", SELECT_COLUMNS),
        params![entry_id],
        row_to_entry,
    )
    .optional()
    .context("Failed to get pipeline entry")
}

/// Entries that still have work to do, oldest publication first
pub fn list_active(conn: &Connection) -> Result<Vec<PipelineEntry>> {
    query_entries(
        conn,
        &format!(
            "SELECT {} FROM pipeline_entries
             WHERE state NOT IN ('notified', 'failed')
             ORDER BY published_at, created_at",
            SELECT_COLUMNS
        ),
    )
}

/// Entries parked for manual review
pub fn list_failed(conn: &Connection) -> Result<Vec<PipelineEntry>> {
    query_entries(
        conn,
        &format!(
            "SELECT {} FROM pipeline_entries
             WHERE state = 'failed'
             ORDER BY updated_at DESC",
            SELECT_COLUMNS
        ),
    )
}

fn query_entries(conn: &Connection, sql: &str) -> Result<Vec<PipelineEntry>> {
    let mut stmt = conn
        .prepare(sql)
        .context("Failed to prepare pipeline entry query")?;

    let entries = stmt
        .query_map([], row_to_entry)
        .context("Failed to execute pipeline entry query")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect pipeline entries")?;

    Ok(entries)
}

fn check_transition(entry_id: &str, from: EntryState, to: EntryState, changed: usize) -> Result<()> {
    if !from.can_transition_to(to) {
        bail!("Invalid transition {} -> {} for {}", from, to, entry_id);
    }
    if changed != 1 {
        bail!("Entry {} is no longer in state {}", entry_id, from);
    }
    Ok(())
}

pub fn record_dispatched(conn: &Connection, entry_id: &str, handle: &TaskHandle) -> Result<()> {
    let handle_json = serde_json::to_string(handle).context("Failed to serialize task handle")?;
    let changed = conn
        .execute(
            "UPDATE pipeline_entries SET
                state = 'dispatched', task_handle = ?2, dispatched_at = ?3,
                attempts = 0, last_error = NULL, updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = 'fetched'",
            params![entry_id, handle_json, Utc::now().to_rfc3339()],
        )
        .context("Failed to record dispatch")?;

    check_transition(entry_id, EntryState::Fetched, EntryState::Dispatched, changed)
}

pub fn record_downloaded(conn: &Connection, entry_id: &str, path: &str) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE pipeline_entries SET
                state = 'downloaded', downloaded_path = ?2,
                attempts = 0, last_error = NULL, updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = 'dispatched'",
            params![entry_id, path],
        )
        .context("Failed to record download")?;

    check_transition(entry_id, EntryState::Dispatched, EntryState::Downloaded, changed)
}

pub fn record_resolved(conn: &Connection, entry_id: &str, resolved: &ResolvedEpisode) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE pipeline_entries SET
                state = 'resolved', series_title = ?2, season = ?3, episode = ?4, confidence = ?5,
                attempts = 0, last_error = NULL, updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = 'downloaded'",
            params![
                entry_id,
                resolved.series_title,
                resolved.season,
                resolved.episode,
                resolved.confidence.as_str()
            ],
        )
        .context("Failed to record resolution")?;

    check_transition(entry_id, EntryState::Downloaded, EntryState::Resolved, changed)
}

pub fn record_renamed(conn: &Connection, entry_id: &str, destination: &str) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE pipeline_entries SET
                state = 'renamed', destination_path = ?2,
                attempts = 0, last_error = NULL, updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = 'resolved'",
            params![entry_id, destination],
        )
        .context("Failed to record rename")?;

    check_transition(entry_id, EntryState::Resolved, EntryState::Renamed, changed)
}

pub fn record_notified(conn: &Connection, entry_id: &str) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE pipeline_entries SET state = 'notified', updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = 'renamed'",
            params![entry_id],
        )
        .context("Failed to record notification")?;

    check_transition(entry_id, EntryState::Renamed, EntryState::Notified, changed)
}

/// Move an entry from `from` to `Failed`, remembering where it failed
pub fn record_failure(
    conn: &Connection,
    entry_id: &str,
    from: EntryState,
    reason: FailureReason,
    error: &str,
) -> Result<()> {
    if !from.can_transition_to(EntryState::Failed) {
        bail!("Entry {} cannot fail from state {}", entry_id, from);
    }

    let changed = conn
        .execute(
            "UPDATE pipeline_entries SET
                state = 'failed', failure_reason = ?3, failed_from = ?2, last_error = ?4,
                updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = ?2",
            params![entry_id, from.as_str(), reason.as_str(), error],
        )
        .context("Failed to record failure")?;

    check_transition(entry_id, from, EntryState::Failed, changed)
}

/// Count a retryable error against the current state; returns the new total
pub fn record_attempt_error(conn: &Connection, entry_id: &str, error: &str) -> Result<u32> {
    let attempts: Option<u32> = conn
        .query_row(
            "UPDATE pipeline_entries SET
                attempts = attempts + 1, last_error = ?2, updated_at = datetime('now')
             WHERE entry_id = ?1
             RETURNING attempts",
            params![entry_id, error],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to record attempt error")?;

    attempts.ok_or_else(|| anyhow::anyhow!("Unknown pipeline entry {}", entry_id))
}

/// Put a failed entry back into the state it failed from
///
/// A failed download goes back to `fetched` with its task handle cleared, so
/// it is dispatched afresh. Returns the restored state, or `None` if the
/// entry is not in `Failed`.
pub fn retry_failed(conn: &Connection, entry_id: &str) -> Result<Option<EntryState>> {
    let restored: Option<String> = conn
        .query_row(
            "UPDATE pipeline_entries SET
                state = CASE
                    WHEN failure_reason = 'download_failed' THEN 'fetched'
                    ELSE COALESCE(failed_from, 'fetched')
                END,
                task_handle = CASE WHEN failure_reason = 'download_failed' THEN NULL ELSE task_handle END,
                dispatched_at = CASE WHEN failure_reason = 'download_failed' THEN NULL ELSE dispatched_at END,
                failure_reason = NULL, failed_from = NULL,
                attempts = 0, last_error = NULL, updated_at = datetime('now')
             WHERE entry_id = ?1 AND state = 'failed'
             RETURNING state",
            params![entry_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to retry entry")?;

    Ok(restored.as_deref().and_then(EntryState::from_db))
}

/// Restart the download clock, used when a timed-out entry is retried
pub fn reset_dispatch_clock(conn: &Connection, entry_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE pipeline_entries SET dispatched_at = ?2 WHERE entry_id = ?1 AND state = 'dispatched'",
        params![entry_id, Utc::now().to_rfc3339()],
    )
    .context("Failed to reset dispatch clock")?;
    Ok(())
}

/// Delete completed entries older than the retention window
pub fn prune_notified(conn: &Connection, retention_days: u32) -> Result<usize> {
    let modifier = format!("-{} days", retention_days);
    let pruned = conn
        .execute(
            "DELETE FROM pipeline_entries
             WHERE state = 'notified' AND updated_at < datetime('now', ?1)
               AND entry_id NOT IN (SELECT entry_id FROM seen_entries)",
            params![modifier],
        )
        .context("Failed to prune pipeline entries")?;

    Ok(pruned)
}

fn row_to_entry(row: &Row) -> rusqlite::Result<PipelineEntry> {
    let state: String = row.get(5)?;
    let failure_reason: Option<String> = row.get(6)?;
    let failed_from: Option<String> = row.get(7)?;
    let task_handle: Option<String> = row.get(8)?;
    let series_title: Option<String> = row.get(10)?;
    let season: Option<u32> = row.get(11)?;
    let episode: Option<u32> = row.get(12)?;
    let confidence: Option<String> = row.get(13)?;
    let dispatched_at: Option<String> = row.get(17)?;

    let resolved = match (series_title, episode) {
        (Some(series_title), Some(episode)) => Some(ResolvedEpisode {
            series_title,
            season: season.unwrap_or(1),
            episode,
            confidence: confidence
                .as_deref()
                .and_then(ConfidenceSource::from_db)
                .unwrap_or(ConfidenceSource::LlmOnly),
        }),
        _ => None,
    };

    Ok(PipelineEntry {
        entry_id: row.get(0)?,
        feed_url: row.get(1)?,
        raw_title: row.get(2)?,
        link: row.get(3)?,
        published_at: row.get(4)?,
        state: EntryState::from_db(&state).unwrap_or(EntryState::Failed),
        failure_reason: failure_reason.as_deref().and_then(FailureReason::from_db),
        failed_from: failed_from.as_deref().and_then(EntryState::from_db),
        task: task_handle.and_then(|json| serde_json::from_str(&json).ok()),
        downloaded_path: row.get(9)?,
        resolved,
        destination_path: row.get(14)?,
        attempts: row.get(15)?,
        last_error: row.get(16)?,
        dispatched_at: dispatched_at
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc)),
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}
