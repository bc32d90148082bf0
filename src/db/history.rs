use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::RenameRecord;
use crate::pipeline::planner::RenamePlan;
use crate::pipeline::resolver::ResolvedEpisode;

/// Record an applied rename
///
/// Re-recording the same destination (a retried cycle) is a no-op.
pub fn record_rename(
    conn: &Connection,
    entry_id: &str,
    plan: &RenamePlan,
    resolved: &ResolvedEpisode,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO rename_history
            (entry_id, source_path, destination_path, series_title, season, episode, confidence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry_id,
            plan.source_path,
            plan.destination_path,
            resolved.series_title,
            resolved.season,
            resolved.episode,
            resolved.confidence.as_str()
        ],
    )
    .context("Failed to record rename")?;

    Ok(())
}

/// Check whether a destination was produced by this system before
pub fn find_by_destination(conn: &Connection, destination: &str) -> Result<Option<RenameRecord>> {
    conn.query_row(
        "SELECT id, entry_id, source_path, destination_path, series_title, season, episode,
                confidence, renamed_at
         FROM rename_history WHERE destination_path = ?1",
        params![destination],
        |row| {
            Ok(RenameRecord {
                id: row.get(0)?,
                entry_id: row.get(1)?,
                source_path: row.get(2)?,
                destination_path: row.get(3)?,
                series_title: row.get(4)?,
                season: row.get(5)?,
                episode: row.get(6)?,
                confidence: row.get(7)?,
                renamed_at: row.get(8)?,
            })
        },
    )
    .optional()
    .context("Failed to look up rename history")
}

/// Get the most recent renames (useful for debugging/admin)
pub fn get_recent_history(conn: &Connection, limit: u32) -> Result<Vec<RenameRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, entry_id, source_path, destination_path, series_title, season, episode,
                    confidence, renamed_at
             FROM rename_history
             ORDER BY id DESC
             LIMIT ?1",
        )
        .context("Failed to prepare get_recent_history query")?;

    let records = stmt
        .query_map([limit], |row| {
            Ok(RenameRecord {
                id: row.get(0)?,
                entry_id: row.get(1)?,
                source_path: row.get(2)?,
                destination_path: row.get(3)?,
                series_title: row.get(4)?,
                season: row.get(5)?,
                episode: row.get(6)?,
                confidence: row.get(7)?,
                renamed_at: row.get(8)?,
            })
        })
        .context("Failed to execute get_recent_history query")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect rename records")?;

    Ok(records)
}
