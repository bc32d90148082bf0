//! Feed health bookkeeping
//!
//! A feed that fails to fetch `limit` times in a row is paused until the
//! process restarts; the other feeds keep going.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::FeedStatus;

pub fn is_paused(conn: &Connection, url: &str) -> Result<bool> {
    let paused: Option<bool> = conn
        .query_row(
            "SELECT paused FROM feed_status WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to check feed status")?;

    Ok(paused.unwrap_or(false))
}

pub fn record_success(conn: &Connection, url: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO feed_status (url, consecutive_failures, paused, last_success_at)
         VALUES (?1, 0, 0, datetime('now'))
         ON CONFLICT(url) DO UPDATE SET
            consecutive_failures = 0, last_error = NULL, last_success_at = datetime('now')",
        params![url],
    )
    .context("Failed to record feed success")?;

    Ok(())
}

/// Count a failed fetch and pause the feed once `limit` is reached
///
/// Returns true only on the call that paused the feed.
pub fn record_failure(conn: &Connection, url: &str, error: &str, limit: u32) -> Result<bool> {
    let (failures, was_paused): (u32, bool) = conn
        .query_row(
            "INSERT INTO feed_status (url, consecutive_failures, last_error)
             VALUES (?1, 1, ?2)
             ON CONFLICT(url) DO UPDATE SET
                consecutive_failures = consecutive_failures + 1, last_error = ?2
             RETURNING consecutive_failures, paused",
            params![url, error],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("Failed to record feed failure")?;

    if was_paused || failures < limit {
        return Ok(false);
    }

    conn.execute(
        "UPDATE feed_status SET paused = 1 WHERE url = ?1",
        params![url],
    )
    .context("Failed to pause feed")?;

    Ok(true)
}

/// Clear every pause, called at startup
pub fn reset_pauses(conn: &Connection) -> Result<usize> {
    let cleared = conn
        .execute(
            "UPDATE feed_status SET paused = 0, consecutive_failures = 0 WHERE paused = 1",
            [],
        )
        .context("Failed to reset feed pauses")?;

    Ok(cleared)
}

pub fn list_feed_status(conn: &Connection) -> Result<Vec<FeedStatus>> {
    let mut stmt = conn
        .prepare(
            "SELECT url, consecutive_failures, paused, last_error, last_success_at
             FROM feed_status ORDER BY url",
        )
        .context("Failed to prepare list_feed_status query")?;

    let statuses = stmt
        .query_map([], |row| {
            Ok(FeedStatus {
                url: row.get(0)?,
                consecutive_failures: row.get(1)?,
                paused: row.get(2)?,
                last_error: row.get(3)?,
                last_success_at: row.get(4)?,
            })
        })
        .context("Failed to execute list_feed_status query")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect feed status")?;

    Ok(statuses)
}
