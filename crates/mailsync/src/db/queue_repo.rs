//! Persisted sync-job queue.
//!
//! Admitted jobs are recorded here keyed by their dedupe key, giving the
//! scheduler at-least-once semantics across process restarts: rows that
//! were running when the process died are re-admitted on the next cycle,
//! and transient failures are rescheduled here with a backoff deadline.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_opt_ts, ts, Database, DatabaseError};
use crate::sync::job::SyncJob;

/// A persisted queue entry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job: SyncJob,
    pub attempts: u32,
    /// `None` means runnable now.
    pub next_retry_at: Option<DateTime<Utc>>,
}

fn from_row(row: &Row<'_>) -> Result<QueueEntry, DatabaseError> {
    let payload: String = row.get("payload")?;
    let job: SyncJob = serde_json::from_str(&payload).map_err(|_| DatabaseError::Corrupt {
        column: "payload",
        value: payload,
    })?;
    Ok(QueueEntry {
        job,
        attempts: row.get::<_, i64>("attempts")? as u32,
        next_retry_at: parse_opt_ts("next_retry_at", row.get("next_retry_at")?)?,
    })
}

/// Records an admitted job. Re-admitting the same dedupe key refreshes the
/// row and clears any pending backoff (the new admission supersedes it).
pub fn upsert(db: &Database, job: &SyncJob, now: DateTime<Utc>) -> Result<(), DatabaseError> {
    let payload = serde_json::to_string(job).map_err(|_| DatabaseError::Corrupt {
        column: "payload",
        value: format!("{:?}", job),
    })?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO sync_queue (dedupe_key, kind, target_key, account_id, payload,
                attempts, next_retry_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6, ?6)
             ON CONFLICT(dedupe_key) DO UPDATE SET
                payload = excluded.payload,
                next_retry_at = NULL,
                updated_at = excluded.updated_at",
            params![
                job.dedupe_key(),
                job.kind().as_str(),
                job.target_key(),
                job.account_id(),
                payload,
                ts(now),
            ],
        )?;
        Ok(())
    })
}

/// Removes a settled job.
pub fn remove(db: &Database, dedupe_key: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| remove_tx(conn, dedupe_key))
}

/// Transactional variant of [`remove`].
pub fn remove_tx(conn: &Connection, dedupe_key: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM sync_queue WHERE dedupe_key = ?1",
        params![dedupe_key],
    )?;
    Ok(())
}

/// Schedules a transient failure for re-execution.
pub fn record_retry(
    db: &Database,
    dedupe_key: &str,
    attempts: u32,
    next_retry_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE sync_queue SET attempts = ?2, next_retry_at = ?3, updated_at = ?4
             WHERE dedupe_key = ?1",
            params![dedupe_key, attempts as i64, ts(next_retry_at), ts(now)],
        )?;
        Ok(())
    })
}

/// Entries runnable at `now`: fresh admissions from a previous process
/// plus retries whose backoff expired.
pub fn due(db: &Database, now: DateTime<Utc>) -> Result<Vec<QueueEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM sync_queue
             WHERE next_retry_at IS NULL OR next_retry_at <= ?1
             ORDER BY created_at ASC",
        )?;
        let mut rows = stmt.query(params![ts(now)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    })
}

/// Pending backoff deadline for a key, if one is scheduled.
pub fn backoff_until(
    db: &Database,
    dedupe_key: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    db.with_conn(|conn| {
        let value: Option<Option<String>> = conn
            .query_row(
                "SELECT next_retry_at FROM sync_queue WHERE dedupe_key = ?1",
                params![dedupe_key],
                |r| r.get(0),
            )
            .optional()?;
        parse_opt_ts("next_retry_at", value.flatten())
    })
}

/// Current attempt count for a key, if queued.
pub fn attempts(db: &Database, dedupe_key: &str) -> Result<Option<u32>, DatabaseError> {
    db.with_conn(|conn| {
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM sync_queue WHERE dedupe_key = ?1",
                params![dedupe_key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(attempts.map(|a| a as u32))
    })
}
