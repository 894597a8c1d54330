//! Local mail store.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle.
//! All access is serialized through a `Mutex<Connection>`; WAL mode is
//! enabled for concurrent read performance. Executors perform their writes
//! through [`Database::with_tx`], which guarantees commit-or-rollback on
//! every exit path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub mod attachment_repo;
pub mod error;
pub mod folder_repo;
pub mod message_repo;
pub mod meta_repo;
pub mod migrations;
pub mod outbox_repo;
pub mod queue_repo;

pub use error::DatabaseError;

/// Thread-safe handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). SQLite serializes writes anyway, so a
/// `Mutex` costs nothing in practice.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the store at the given path and runs all pending
    /// migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        log::info!("Mail store opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside a transaction. Commits only when `f` succeeds; any
    /// error (or panic unwinding) rolls back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Returns the canonical store path: `~/.mailsync/data/mailsync.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mailsync").join("data").join("mailsync.db"))
}

/// Formats a timestamp for storage (RFC 3339 TEXT columns).
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parses a stored timestamp, surfacing corruption instead of panicking.
pub(crate) fn parse_ts(column: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| DatabaseError::Corrupt {
            column,
            value: value.to_string(),
        })
}

/// Parses an optional stored timestamp.
pub(crate) fn parse_opt_ts(
    column: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value.map(|v| parse_ts(column, &v)).transpose()
}
