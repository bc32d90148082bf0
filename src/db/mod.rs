pub mod entries;
pub mod feeds;
pub mod history;
pub mod schema;
pub mod seen;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

/// Shared handle to the SQLite connection
///
/// Cloned into every component that needs persisted state; there is no
/// global connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file and make sure the schema exists
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory for {}", path))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database connection")?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        schema::init_database(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a database operation while holding the connection lock
    ///
    /// rusqlite is synchronous; the mutex serializes access so every closure
    /// sees a consistent view and compare-and-swap style statements stay atomic.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Same as [`Db::with_conn`] but with mutable access, for transactions
    pub async fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }
}

/// Data models for the database layer
pub mod models {
    use serde::{Deserialize, Serialize};

    /// Outcome of the dispatch step as recorded by the Seen-Entry Store
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DispatchStatus {
        /// Reserved by a worker that is about to call the download backend
        Pending,
        Success,
        /// Dispatch attempt failed, the entry may be reserved again
        Failed,
        /// Gave up after too many failed dispatches
        Abandoned,
    }

    impl DispatchStatus {
        pub fn as_str(&self) -> &'static str {
            match self {
                DispatchStatus::Pending => "pending",
                DispatchStatus::Success => "success",
                DispatchStatus::Failed => "failed",
                DispatchStatus::Abandoned => "abandoned",
            }
        }

        pub fn from_db(value: &str) -> Option<Self> {
            match value {
                "pending" => Some(DispatchStatus::Pending),
                "success" => Some(DispatchStatus::Success),
                "failed" => Some(DispatchStatus::Failed),
                "abandoned" => Some(DispatchStatus::Abandoned),
                _ => None,
            }
        }
    }

    /// One row of the Seen-Entry Store
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SeenRecord {
        pub entry_id: String,
        pub first_seen_at: String,
        pub dispatch_status: DispatchStatus,
        pub updated_at: String,
    }

    /// A rename that was applied to the library
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RenameRecord {
        pub id: i64,
        pub entry_id: String,
        pub source_path: String,
        pub destination_path: String,
        pub series_title: String,
        pub season: u32,
        pub episode: u32,
        pub confidence: String,
        pub renamed_at: String,
    }

    /// Health of a configured feed
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FeedStatus {
        pub url: String,
        pub consecutive_failures: u32,
        pub paused: bool,
        pub last_error: Option<String>,
        pub last_success_at: Option<String>,
    }
}
