//! Pending-action outbox repository.
//!
//! Rows are deleted on successful remote application. A row that exhausts
//! its attempt budget transitions to `failed` and is retained as a dead
//! letter for user-visible surfacing; it is never silently dropped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{parse_opt_ts, parse_ts, ts, Database, DatabaseError};
use crate::models::{ActionStatus, ActionType, PendingAction};

fn from_row(row: &Row<'_>) -> Result<PendingAction, DatabaseError> {
    let action_type: String = row.get("action_type")?;
    let payload_json: String = row.get("payload")?;
    let payload: BTreeMap<String, String> =
        serde_json::from_str(&payload_json).map_err(|_| DatabaseError::Corrupt {
            column: "payload",
            value: payload_json.clone(),
        })?;
    let status: String = row.get("status")?;
    let created: String = row.get("created_at")?;

    Ok(PendingAction {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        action_type: ActionType::parse(&action_type).ok_or(DatabaseError::Corrupt {
            column: "action_type",
            value: action_type,
        })?,
        entity_id: row.get("entity_id")?,
        payload,
        status: ActionStatus::parse(&status),
        created_at: parse_ts("created_at", &created)?,
        last_attempt_at: parse_opt_ts("last_attempt_at", row.get("last_attempt_at")?)?,
        attempt_count: row.get::<_, i64>("attempt_count")? as u32,
        max_attempts: row.get::<_, i64>("max_attempts")? as u32,
        last_error: row.get("last_error")?,
    })
}

/// Enqueues a new action, returning its row id.
pub fn enqueue(db: &Database, action: &PendingAction) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| enqueue_tx(conn, action))
}

/// Transactional variant of [`enqueue`], for callers that also flag the
/// entity `PendingUpload` in the same transaction.
pub fn enqueue_tx(conn: &Connection, action: &PendingAction) -> Result<i64, DatabaseError> {
    let payload = serde_json::to_string(&action.payload).map_err(|_| DatabaseError::Corrupt {
        column: "payload",
        value: format!("{:?}", action.payload),
    })?;
    conn.execute(
        "INSERT INTO pending_actions (account_id, action_type, entity_id, payload, status,
            created_at, last_attempt_at, attempt_count, max_attempts, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            action.account_id,
            action.action_type.as_str(),
            action.entity_id,
            payload,
            action.status.as_str(),
            ts(action.created_at),
            action.last_attempt_at.map(ts),
            action.attempt_count as i64,
            action.max_attempts as i64,
            action.last_error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finds an action by id.
pub fn get(db: &Database, id: i64) -> Result<Option<PendingAction>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM pending_actions WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(from_row(row)?)),
            None => Ok(None),
        }
    })
}

/// Drainable actions for one account, FIFO (insertion order).
pub fn list_due(db: &Database, account_id: &str) -> Result<Vec<PendingAction>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM pending_actions
             WHERE account_id = ?1 AND status IN ('pending', 'retry')
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![account_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    })
}

/// Dead letters for one account, for user-visible surfacing.
pub fn list_failed(db: &Database, account_id: &str) -> Result<Vec<PendingAction>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM pending_actions
             WHERE account_id = ?1 AND status = 'failed'
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![account_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    })
}

/// Accounts that currently have drainable actions.
pub fn accounts_with_pending(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT account_id FROM pending_actions
             WHERE status IN ('pending', 'retry') ORDER BY account_id",
        )?;
        let accounts = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    })
}

/// Deletes an action after successful remote application (or user
/// discard).
pub fn delete_tx(conn: &Connection, id: i64) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM pending_actions WHERE id = ?1", params![id])?;
    Ok(())
}

/// Records a failed attempt: bumps the attempt count and moves the row to
/// `retry`, or to `failed` once the budget is exhausted. Returns the new
/// status.
pub fn record_failure(
    db: &Database,
    action: &PendingAction,
    error: &str,
    now: DateTime<Utc>,
) -> Result<ActionStatus, DatabaseError> {
    let attempts = action.attempt_count + 1;
    let status = if attempts >= action.max_attempts {
        ActionStatus::Failed
    } else {
        ActionStatus::Retry
    };

    db.with_conn(|conn| {
        conn.execute(
            "UPDATE pending_actions SET attempt_count = ?2, last_attempt_at = ?3,
                last_error = ?4, status = ?5
             WHERE id = ?1",
            params![
                action.id,
                attempts as i64,
                ts(now),
                error,
                status.as_str(),
            ],
        )?;
        Ok(())
    })?;

    Ok(status)
}

/// User-initiated retry of a dead letter: resets the attempt budget.
pub fn reset_for_retry(db: &Database, id: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE pending_actions SET status = 'pending', attempt_count = 0, last_error = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        Ok(())
    })
}
