//! Folder sync-state repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_opt_ts, ts, Database, DatabaseError};
use crate::models::FolderSyncState;

fn from_row(row: &Row<'_>) -> Result<FolderSyncState, DatabaseError> {
    Ok(FolderSyncState {
        folder_id: row.get("id")?,
        account_id: row.get("account_id")?,
        display_name: row.get("display_name")?,
        sync_token: row.get("sync_token")?,
        last_synced_at: parse_opt_ts("last_synced_at", row.get("last_synced_at")?)?,
        continuous_history_to: parse_opt_ts(
            "continuous_history_to",
            row.get("continuous_history_to")?,
        )?,
    })
}

/// Inserts or replaces a folder row.
pub fn upsert(db: &Database, state: &FolderSyncState) -> Result<(), DatabaseError> {
    db.with_conn(|conn| upsert_tx(conn, state))
}

/// Transactional variant of [`upsert`].
pub fn upsert_tx(conn: &Connection, state: &FolderSyncState) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO folders (id, account_id, display_name, sync_token, last_synced_at, continuous_history_to)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            account_id = excluded.account_id,
            display_name = excluded.display_name,
            sync_token = excluded.sync_token,
            last_synced_at = excluded.last_synced_at,
            continuous_history_to = excluded.continuous_history_to",
        params![
            state.folder_id,
            state.account_id,
            state.display_name,
            state.sync_token,
            state.last_synced_at.map(ts),
            state.continuous_history_to.map(ts),
        ],
    )?;
    Ok(())
}

/// Finds a folder by id.
pub fn get(db: &Database, folder_id: &str) -> Result<Option<FolderSyncState>, DatabaseError> {
    db.with_conn(|conn| get_tx(conn, folder_id))
}

/// Transactional variant of [`get`].
pub fn get_tx(conn: &Connection, folder_id: &str) -> Result<Option<FolderSyncState>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM folders WHERE id = ?1",
            params![folder_id],
            |row| {
                Ok((
                    row.get::<_, String>("id")?,
                    row.get::<_, String>("account_id")?,
                    row.get::<_, String>("display_name")?,
                    row.get::<_, Option<String>>("sync_token")?,
                    row.get::<_, Option<String>>("last_synced_at")?,
                    row.get::<_, Option<String>>("continuous_history_to")?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, account_id, display_name, sync_token, last_synced, history_to)| {
        Ok(FolderSyncState {
            folder_id: id,
            account_id,
            display_name,
            sync_token,
            last_synced_at: parse_opt_ts("last_synced_at", last_synced)?,
            continuous_history_to: parse_opt_ts("continuous_history_to", history_to)?,
        })
    })
    .transpose()
}

/// Lists all folders across accounts.
pub fn list_all(db: &Database) -> Result<Vec<FolderSyncState>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM folders ORDER BY account_id, id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    })
}

/// Updates the delta cursor and sync bookkeeping inside an executor
/// transaction.
pub fn update_sync_state_tx(
    conn: &Connection,
    folder_id: &str,
    sync_token: Option<&str>,
    last_synced_at: DateTime<Utc>,
    continuous_history_to: Option<DateTime<Utc>>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE folders SET sync_token = ?2, last_synced_at = ?3, continuous_history_to = ?4
         WHERE id = ?1",
        params![
            folder_id,
            sync_token,
            ts(last_synced_at),
            continuous_history_to.map(ts),
        ],
    )?;
    Ok(())
}

/// Advances only the continuity marker (backfill executor).
pub fn update_history_marker_tx(
    conn: &Connection,
    folder_id: &str,
    continuous_history_to: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE folders SET continuous_history_to = ?2 WHERE id = ?1",
        params![folder_id, ts(continuous_history_to)],
    )?;
    Ok(())
}

/// Drops the delta cursor, forcing the next sync to perform a full listing.
pub fn clear_token(db: &Database, folder_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE folders SET sync_token = NULL WHERE id = ?1",
            params![folder_id],
        )?;
        Ok(())
    })
}

/// Folders whose last sync is older than the staleness cutoff (or that have
/// never synced).
pub fn stale_folders(
    db: &Database,
    cutoff: DateTime<Utc>,
) -> Result<Vec<FolderSyncState>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM folders WHERE last_synced_at IS NULL OR last_synced_at < ?1
             ORDER BY account_id, id",
        )?;
        let mut rows = stmt.query(params![ts(cutoff)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    })
}

/// Folders whose gap-free history does not yet reach the retention horizon.
pub fn folders_needing_backfill(
    db: &Database,
    horizon: DateTime<Utc>,
) -> Result<Vec<FolderSyncState>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM folders
             WHERE continuous_history_to IS NOT NULL AND continuous_history_to > ?1
             ORDER BY account_id, id",
        )?;
        let mut rows = stmt.query(params![ts(horizon)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    })
}
