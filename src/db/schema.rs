use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all database tables if they don't exist
pub fn init_database(conn: &Connection) -> Result<()> {
    // Seen-Entry Store: one row per feed entry id, ever
    conn.execute(
        "CREATE TABLE IF NOT EXISTS seen_entries (
            entry_id TEXT PRIMARY KEY,
            first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
            dispatch_status TEXT NOT NULL DEFAULT 'pending',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )
    .context("Failed to create seen_entries table")?;

    // Per-entry pipeline state, enough to resume after a restart
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_entries (
            entry_id TEXT PRIMARY KEY,
            feed_url TEXT NOT NULL,
            raw_title TEXT NOT NULL,
            link TEXT NOT NULL,
            published_at TEXT,
            state TEXT NOT NULL DEFAULT 'fetched',
            failure_reason TEXT,
            failed_from TEXT,
            task_handle TEXT,
            downloaded_path TEXT,
            series_title TEXT,
            season INTEGER,
            episode INTEGER,
            confidence TEXT,
            destination_path TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            dispatched_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )
    .context("Failed to create pipeline_entries table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_entries_state ON pipeline_entries(state)",
        [],
    )
    .context("Failed to create pipeline_entries state index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rename_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            destination_path TEXT NOT NULL UNIQUE,
            series_title TEXT NOT NULL,
            season INTEGER NOT NULL,
            episode INTEGER NOT NULL,
            confidence TEXT NOT NULL,
            renamed_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )
    .context("Failed to create rename_history table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feed_status (
            url TEXT PRIMARY KEY,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            paused INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_success_at TEXT
        )",
        [],
    )
    .context("Failed to create feed_status table")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_init_database() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"seen_entries".to_string()));
        assert!(tables.contains(&"pipeline_entries".to_string()));
        assert!(tables.contains(&"rename_history".to_string()));
        assert!(tables.contains(&"feed_status".to_string()));
    }

    #[test]
    fn test_init_database_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
    }
}
