//! Attachment repository.
//!
//! Metadata rows are written when a message body is fetched; content lives
//! on disk under the configured content directory, with the local path
//! recorded here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_opt_ts, ts, Database, DatabaseError};
use crate::models::{AttachmentDownloadState, AttachmentMeta};

/// A full attachment row.
#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub meta: AttachmentMeta,
    pub state: AttachmentDownloadState,
    pub local_path: Option<String>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

fn from_row(row: &Row<'_>) -> Result<AttachmentRow, DatabaseError> {
    Ok(AttachmentRow {
        meta: AttachmentMeta {
            attachment_id: row.get("attachment_id")?,
            message_id: row.get("message_id")?,
            filename: row.get("filename")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        },
        state: AttachmentDownloadState::from_ordinal(row.get("state")?),
        local_path: row.get("local_path")?,
        downloaded_at: parse_opt_ts("downloaded_at", row.get("downloaded_at")?)?,
        last_accessed_at: parse_opt_ts("last_accessed_at", row.get("last_accessed_at")?)?,
        last_error: row.get("last_error")?,
    })
}

/// Inserts or refreshes attachment metadata without touching download
/// state.
pub fn upsert_meta_tx(conn: &Connection, meta: &AttachmentMeta) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO attachments (message_id, attachment_id, filename, mime_type, size_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(message_id, attachment_id) DO UPDATE SET
            filename = excluded.filename,
            mime_type = excluded.mime_type,
            size_bytes = excluded.size_bytes",
        params![
            meta.message_id,
            meta.attachment_id,
            meta.filename,
            meta.mime_type,
            meta.size_bytes as i64,
        ],
    )?;
    Ok(())
}

/// Finds one attachment row.
pub fn get(
    db: &Database,
    message_id: &str,
    attachment_id: &str,
) -> Result<Option<AttachmentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM attachments WHERE message_id = ?1 AND attachment_id = ?2")?;
        let mut rows = stmt.query(params![message_id, attachment_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_row(row)?)),
            None => Ok(None),
        }
    })
}

/// Marks an attachment downloaded. `Downloaded` always carries a local
/// path.
pub fn mark_downloaded_tx(
    conn: &Connection,
    message_id: &str,
    attachment_id: &str,
    local_path: &str,
    size_bytes: u64,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE attachments SET state = ?3, local_path = ?4, size_bytes = ?5,
            downloaded_at = ?6, last_accessed_at = ?6, last_error = NULL
         WHERE message_id = ?1 AND attachment_id = ?2",
        params![
            message_id,
            attachment_id,
            AttachmentDownloadState::Downloaded.as_ordinal(),
            local_path,
            size_bytes as i64,
            ts(now),
        ],
    )?;
    Ok(())
}

/// Marks a download permanently failed.
pub fn mark_failed(
    db: &Database,
    message_id: &str,
    attachment_id: &str,
    error: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE attachments SET state = ?3, last_error = ?4
             WHERE message_id = ?1 AND attachment_id = ?2",
            params![
                message_id,
                attachment_id,
                AttachmentDownloadState::Failed.as_ordinal(),
                error,
            ],
        )?;
        Ok(())
    })
}

/// Records a read access.
pub fn touch_access(
    db: &Database,
    message_id: &str,
    attachment_id: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE attachments SET last_accessed_at = ?3
             WHERE message_id = ?1 AND attachment_id = ?2",
            params![message_id, attachment_id, ts(now)],
        )?;
        Ok(())
    })
}

/// Attachments in a folder that are not yet downloaded (and not failed).
pub fn missing_for_folder(
    db: &Database,
    folder_id: &str,
    limit: u32,
) -> Result<Vec<(String, String)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT a.message_id, a.attachment_id FROM attachments a
             JOIN messages m ON m.id = a.message_id
             WHERE m.folder_id = ?1 AND a.state = 0
             ORDER BY m.received_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![folder_id, limit], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// An eviction candidate attachment.
#[derive(Debug, Clone)]
pub struct EvictableAttachment {
    pub message_id: String,
    pub attachment_id: String,
    pub local_path: Option<String>,
    pub size_bytes: u64,
}

/// Downloaded attachments older than `older_than` and not accessed since
/// `not_accessed_since`, largest first.
pub fn evictable(
    db: &Database,
    older_than: DateTime<Utc>,
    not_accessed_since: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<EvictableAttachment>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT message_id, attachment_id, local_path, size_bytes FROM attachments
             WHERE state = 1
               AND downloaded_at IS NOT NULL AND downloaded_at < ?1
               AND (last_accessed_at IS NULL OR last_accessed_at < ?2)
             ORDER BY size_bytes DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![ts(older_than), ts(not_accessed_since), limit], |r| {
                Ok(EvictableAttachment {
                    message_id: r.get(0)?,
                    attachment_id: r.get(1)?,
                    local_path: r.get(2)?,
                    size_bytes: r.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Drops downloaded content: state back to `NotDownloaded`, path cleared.
/// The metadata row (and its recorded remote size) remains.
pub fn clear_content_tx(
    conn: &Connection,
    message_id: &str,
    attachment_id: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE attachments SET state = 0, local_path = NULL, downloaded_at = NULL
         WHERE message_id = ?1 AND attachment_id = ?2",
        params![message_id, attachment_id],
    )?;
    Ok(())
}

/// Counts downloaded attachments (diagnostics).
pub fn count_downloaded(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: Option<i64> = conn
            .query_row("SELECT COUNT(*) FROM attachments WHERE state = 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    })
}
