//! Small key/value store for engine bookkeeping (e.g. the eviction
//! last-run timestamp).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_ts, ts, Database, DatabaseError};

pub const EVICTION_LAST_RUN: &str = "eviction_last_run";

/// Reads a meta value.
pub fn get(db: &Database, key: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM engine_meta WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    })
}

/// Writes a meta value.
pub fn set(db: &Database, key: &str, value: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| set_tx(conn, key, value))
}

/// Transactional variant of [`set`].
pub fn set_tx(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Reads a timestamp-valued meta key.
pub fn get_timestamp(db: &Database, key: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    match get(db, key)? {
        Some(value) => Ok(Some(parse_ts("value", &value)?)),
        None => Ok(None),
    }
}

/// Writes a timestamp-valued meta key.
pub fn set_timestamp(db: &Database, key: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
    set(db, key, &ts(at))
}
