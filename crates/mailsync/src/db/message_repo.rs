//! Message and body repository.
//!
//! Message rows are metadata and survive eviction; body content lives in
//! `message_bodies` and can be dropped independently.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_ts, ts, Database, DatabaseError};
use crate::models::{EntitySyncStatus, MessageEnvelope};

fn envelope_from_row(row: &Row<'_>) -> Result<MessageEnvelope, DatabaseError> {
    let received: String = row.get("received_at")?;
    Ok(MessageEnvelope {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        folder_id: row.get("folder_id")?,
        subject: row.get("subject")?,
        sender: row.get("sender")?,
        received_at: parse_ts("received_at", &received)?,
        is_read: row.get("is_read")?,
        has_attachments: row.get("has_attachments")?,
    })
}

/// Inserts or updates a message from a provider envelope and ensures its
/// body row exists. Running twice with the same input is a no-op.
pub fn upsert_envelope_tx(conn: &Connection, env: &MessageEnvelope) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO messages (id, account_id, folder_id, subject, sender, received_at,
            is_read, has_attachments, sync_status, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
         ON CONFLICT(id) DO UPDATE SET
            folder_id = excluded.folder_id,
            subject = excluded.subject,
            sender = excluded.sender,
            received_at = excluded.received_at,
            is_read = excluded.is_read,
            has_attachments = excluded.has_attachments,
            sync_status = excluded.sync_status,
            last_error = NULL",
        params![
            env.id,
            env.account_id,
            env.folder_id,
            env.subject,
            env.sender,
            ts(env.received_at),
            env.is_read,
            env.has_attachments,
            EntitySyncStatus::Synced.as_str(),
        ],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO message_bodies (message_id) VALUES (?1)",
        params![env.id],
    )?;
    Ok(())
}

/// Removes a message (body and attachments cascade).
pub fn remove_tx(conn: &Connection, message_id: &str) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
    Ok(())
}

/// Finds a message envelope by id.
pub fn get_envelope(db: &Database, message_id: &str) -> Result<Option<MessageEnvelope>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM messages WHERE id = ?1")?;
        let mut rows = stmt.query(params![message_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(envelope_from_row(row)?)),
            None => Ok(None),
        }
    })
}

/// Lists envelopes in a folder, newest first.
pub fn list_folder(db: &Database, folder_id: &str) -> Result<Vec<MessageEnvelope>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM messages WHERE folder_id = ?1 ORDER BY received_at DESC")?;
        let mut rows = stmt.query(params![folder_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(envelope_from_row(row)?);
        }
        Ok(out)
    })
}

/// Updates a message's sync status.
pub fn set_sync_status(
    db: &Database,
    message_id: &str,
    status: EntitySyncStatus,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| set_sync_status_tx(conn, message_id, status))
}

/// Transactional variant of [`set_sync_status`].
pub fn set_sync_status_tx(
    conn: &Connection,
    message_id: &str,
    status: EntitySyncStatus,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE messages SET sync_status = ?2 WHERE id = ?1",
        params![message_id, status.as_str()],
    )?;
    Ok(())
}

/// Returns a `PendingUpload` message to `Synced` once its queued action has
/// been applied remotely. Messages in any other state are left alone.
pub fn settle_pending_upload_tx(conn: &Connection, message_id: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE messages SET sync_status = ?2 WHERE id = ?1 AND sync_status = ?3",
        params![
            message_id,
            EntitySyncStatus::Synced.as_str(),
            EntitySyncStatus::PendingUpload.as_str(),
        ],
    )?;
    Ok(())
}

/// Reads a message's sync status.
pub fn sync_status(db: &Database, message_id: &str) -> Result<Option<EntitySyncStatus>, DatabaseError> {
    db.with_conn(|conn| {
        let status: Option<String> = conn
            .query_row(
                "SELECT sync_status FROM messages WHERE id = ?1",
                params![message_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status.map(|s| EntitySyncStatus::parse(&s)))
    })
}

/// Marks a message failed with a user-visible error. Not retried
/// automatically.
pub fn mark_error(db: &Database, message_id: &str, error: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE messages SET sync_status = ?2, last_error = ?3 WHERE id = ?1",
            params![message_id, EntitySyncStatus::Error.as_str(), error],
        )?;
        Ok(())
    })
}

/// Stores a fetched body and settles the message row in the same
/// transaction.
pub fn store_body_tx(
    conn: &Connection,
    message_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO message_bodies (message_id, content, size_bytes, downloaded_at, last_accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(message_id) DO UPDATE SET
            content = excluded.content,
            size_bytes = excluded.size_bytes,
            downloaded_at = excluded.downloaded_at,
            last_accessed_at = excluded.last_accessed_at",
        params![message_id, content, content.len() as i64, ts(now)],
    )?;
    conn.execute(
        "UPDATE messages SET sync_status = ?2, last_error = NULL WHERE id = ?1",
        params![message_id, EntitySyncStatus::Synced.as_str()],
    )?;
    Ok(())
}

/// Returns cached body content, if present.
pub fn body_content(db: &Database, message_id: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let content: Option<Option<String>> = conn
            .query_row(
                "SELECT content FROM message_bodies WHERE message_id = ?1",
                params![message_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(content.flatten())
    })
}

/// Records a read access, protecting the body from eviction for the access
/// window.
pub fn touch_body_access(
    db: &Database,
    message_id: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE message_bodies SET last_accessed_at = ?2 WHERE message_id = ?1",
            params![message_id, ts(now)],
        )?;
        Ok(())
    })
}

/// Message ids in a folder whose body content is missing.
pub fn missing_body_ids(
    db: &Database,
    folder_id: &str,
    limit: u32,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT m.id FROM messages m
             JOIN message_bodies b ON b.message_id = m.id
             WHERE m.folder_id = ?1 AND b.content IS NULL AND m.sync_status != 'error'
             ORDER BY m.received_at DESC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![folder_id, limit], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Total cached content bytes: body text plus downloaded attachment files.
pub fn cache_usage_bytes(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let bodies: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM message_bodies WHERE content IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let attachments: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM attachments WHERE state = 1",
            [],
            |r| r.get(0),
        )?;
        Ok((bodies + attachments) as u64)
    })
}

/// An eviction candidate body.
#[derive(Debug, Clone)]
pub struct EvictableBody {
    pub message_id: String,
    pub size_bytes: u64,
}

/// Bodies downloaded before `older_than` and not accessed since
/// `not_accessed_since`, largest first.
pub fn evictable_bodies(
    db: &Database,
    older_than: DateTime<Utc>,
    not_accessed_since: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<EvictableBody>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT message_id, size_bytes FROM message_bodies
             WHERE content IS NOT NULL
               AND downloaded_at IS NOT NULL AND downloaded_at < ?1
               AND (last_accessed_at IS NULL OR last_accessed_at < ?2)
             ORDER BY size_bytes DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![ts(older_than), ts(not_accessed_since), limit], |r| {
                Ok(EvictableBody {
                    message_id: r.get(0)?,
                    size_bytes: r.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Drops body content while keeping the metadata row queryable.
pub fn clear_body_content_tx(conn: &Connection, message_id: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE message_bodies SET content = NULL, size_bytes = 0, downloaded_at = NULL
         WHERE message_id = ?1",
        params![message_id],
    )?;
    conn.execute(
        "UPDATE messages SET sync_status = ?2 WHERE id = ?1 AND sync_status = ?3",
        params![
            message_id,
            EntitySyncStatus::Idle.as_str(),
            EntitySyncStatus::Synced.as_str(),
        ],
    )?;
    Ok(())
}
