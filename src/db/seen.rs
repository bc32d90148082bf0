//! Seen-Entry Store
//!
//! Durable set of feed entry ids that have been picked up for dispatch.
//! `try_reserve` is the only way into the `pending` state and is a single
//! conditional upsert, so two workers racing on the same id cannot both win.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{DispatchStatus, SeenRecord};

/// True when the entry has a record that blocks a new dispatch
///
/// Only a `failed` dispatch leaves the entry eligible again.
pub fn is_seen(conn: &Connection, entry_id: &str) -> Result<bool> {
    let status: Option<String> = conn
        .query_row(
            "SELECT dispatch_status FROM seen_entries WHERE entry_id = ?1",
            params![entry_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to check seen entry")?;

    Ok(matches!(status.as_deref(), Some(s) if s != DispatchStatus::Failed.as_str()))
}

/// Idempotent upsert of the dispatch status
///
/// A `success` record is never downgraded; re-announcements of an already
/// dispatched entry therefore can't make it eligible again.
pub fn mark_seen(conn: &Connection, entry_id: &str, status: DispatchStatus) -> Result<()> {
    conn.execute(
        "INSERT INTO seen_entries (entry_id, dispatch_status) VALUES (?1, ?2)
         ON CONFLICT(entry_id) DO UPDATE SET
            dispatch_status = CASE
                WHEN seen_entries.dispatch_status = 'success' THEN 'success'
                ELSE excluded.dispatch_status
            END,
            updated_at = datetime('now')",
        params![entry_id, status.as_str()],
    )
    .with_context(|| format!("Failed to mark entry {} as {}", entry_id, status.as_str()))?;

    Ok(())
}

/// Check-then-reserve in one statement
///
/// Inserts a `pending` record, or flips a `failed` record back to `pending`.
/// Returns true only for the caller that performed the change.
pub fn try_reserve(conn: &Connection, entry_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "INSERT INTO seen_entries (entry_id, dispatch_status) VALUES (?1, 'pending')
             ON CONFLICT(entry_id) DO UPDATE SET
                dispatch_status = 'pending',
                updated_at = datetime('now')
             WHERE seen_entries.dispatch_status = 'failed'",
            params![entry_id],
        )
        .with_context(|| format!("Failed to reserve entry {}", entry_id))?;

    Ok(changed == 1)
}

/// Make an entry eligible for dispatch again
///
/// Only used for a manual retry; this is the one path that may turn a
/// `success` record back into `failed`.
pub fn reopen(conn: &Connection, entry_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE seen_entries SET dispatch_status = 'failed', updated_at = datetime('now')
             WHERE entry_id = ?1 AND dispatch_status != 'failed'",
            params![entry_id],
        )
        .context("Failed to reopen seen entry")?;

    Ok(changed == 1)
}

/// Release reservations left behind by a crash between reserve and dispatch
///
/// Only entries whose pipeline record never reached `dispatched` are touched,
/// so a task handle that was persisted is never dispatched again.
pub fn release_stale_reservations(conn: &Connection) -> Result<usize> {
    let released = conn
        .execute(
            "UPDATE seen_entries SET dispatch_status = 'failed', updated_at = datetime('now')
             WHERE dispatch_status = 'pending'
               AND entry_id IN (SELECT entry_id FROM pipeline_entries WHERE state = 'fetched')",
            [],
        )
        .context("Failed to release stale reservations")?;

    Ok(released)
}

pub fn get_seen(conn: &Connection, entry_id: &str) -> Result<Option<SeenRecord>> {
    conn.query_row(
        "SELECT entry_id, first_seen_at, dispatch_status, updated_at
         FROM seen_entries WHERE entry_id = ?1",
        params![entry_id],
        row_to_record,
    )
    .optional()
    .context("Failed to get seen entry")
}

/// All records, newest first, for review reporting
pub fn list_seen(conn: &Connection) -> Result<Vec<SeenRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT entry_id, first_seen_at, dispatch_status, updated_at
             FROM seen_entries
             ORDER BY first_seen_at DESC",
        )
        .context("Failed to prepare list_seen query")?;

    let records = stmt
        .query_map([], row_to_record)
        .context("Failed to execute list_seen query")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect seen records")?;

    Ok(records)
}

/// Drop settled records older than the retention window
///
/// Pending and failed records, and records whose pipeline entry is still
/// being worked on, are kept regardless of age.
pub fn prune_older_than(conn: &Connection, retention_days: u32) -> Result<usize> {
    let modifier = format!("-{} days", retention_days);
    let pruned = conn
        .execute(
            "DELETE FROM seen_entries
             WHERE dispatch_status IN ('success', 'abandoned')
               AND first_seen_at < datetime('now', ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM pipeline_entries p
                   WHERE p.entry_id = seen_entries.entry_id
                     AND p.state NOT IN ('notified', 'failed')
               )",
            params![modifier],
        )
        .context("Failed to prune seen entries")?;

    Ok(pruned)
}

fn row_to_record(row: &Row) -> rusqlite::Result<SeenRecord> {
    let status: String = row.get(2)?;
    Ok(SeenRecord {
        entry_id: row.get(0)?,
        first_seen_at: row.get(1)?,
        dispatch_status: DispatchStatus::from_db(&status).unwrap_or(DispatchStatus::Failed),
        updated_at: row.get(3)?,
    })
}
