//! Core domain types shared across the engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Synchronization status of a cached entity (message, folder, attachment
/// or body row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySyncStatus {
    Synced,
    PendingUpload,
    PendingDownload,
    Error,
    Idle,
}

impl EntitySyncStatus {
    /// Text form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Synced => "synced",
            EntitySyncStatus::PendingUpload => "pending_upload",
            EntitySyncStatus::PendingDownload => "pending_download",
            EntitySyncStatus::Error => "error",
            EntitySyncStatus::Idle => "idle",
        }
    }

    /// Parses the stored text form. Unknown values map to `Idle` so that
    /// schema drift never poisons reads.
    pub fn parse(s: &str) -> Self {
        match s {
            "synced" => EntitySyncStatus::Synced,
            "pending_upload" => EntitySyncStatus::PendingUpload,
            "pending_download" => EntitySyncStatus::PendingDownload,
            "error" => EntitySyncStatus::Error,
            _ => EntitySyncStatus::Idle,
        }
    }
}

impl std::fmt::Display for EntitySyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download state of an attachment, stored as its ordinal.
///
/// `Downloaded` requires a non-null local content path on the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentDownloadState {
    NotDownloaded,
    Downloaded,
    Failed,
}

impl AttachmentDownloadState {
    /// Ordinal stored in the database.
    pub fn as_ordinal(&self) -> i64 {
        match self {
            AttachmentDownloadState::NotDownloaded => 0,
            AttachmentDownloadState::Downloaded => 1,
            AttachmentDownloadState::Failed => 2,
        }
    }

    /// Maps a stored ordinal back. Unknown ordinals are treated as
    /// `NotDownloaded` (content can always be re-fetched).
    pub fn from_ordinal(ordinal: i64) -> Self {
        match ordinal {
            1 => AttachmentDownloadState::Downloaded,
            2 => AttachmentDownloadState::Failed,
            _ => AttachmentDownloadState::NotDownloaded,
        }
    }
}

/// Status of a pending outbox action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Retry,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Retry => "retry",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "retry" => ActionStatus::Retry,
            "failed" => ActionStatus::Failed,
            _ => ActionStatus::Pending,
        }
    }
}

/// Kind of user-originated mutation queued in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    MarkRead,
    MarkUnread,
    Move,
    Delete,
    Send,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MarkRead => "mark_read",
            ActionType::MarkUnread => "mark_unread",
            ActionType::Move => "move",
            ActionType::Delete => "delete",
            ActionType::Send => "send",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mark_read" => Some(ActionType::MarkRead),
            "mark_unread" => Some(ActionType::MarkUnread),
            "move" => Some(ActionType::Move),
            "delete" => Some(ActionType::Delete),
            "send" => Some(ActionType::Send),
            _ => None,
        }
    }
}

/// A user-originated mutation awaiting remote application.
///
/// Rows are deleted on successful application and retained as dead letters
/// once `attempt_count` reaches `max_attempts`.
#[derive(Debug, Clone)]
pub struct PendingAction {
    /// Database row id (0 until inserted).
    pub id: i64,
    pub account_id: String,
    pub action_type: ActionType,
    /// The message or folder the action applies to.
    pub entity_id: String,
    /// Opaque provider-specific parameters (e.g. target folder of a move).
    pub payload: BTreeMap<String, String>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl PendingAction {
    /// Creates a fresh, not-yet-persisted action with the default attempt
    /// budget.
    pub fn new(
        account_id: &str,
        action_type: ActionType,
        entity_id: &str,
        payload: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: 0,
            account_id: account_id.to_string(),
            action_type,
            entity_id: entity_id.to_string(),
            payload,
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            last_attempt_at: None,
            attempt_count: 0,
            max_attempts: 5,
            last_error: None,
        }
    }
}

/// Persisted per-folder delta cursor and continuity bookkeeping.
///
/// Mutated only by the folder executors, inside the same transaction as the
/// message writes they perform.
#[derive(Debug, Clone)]
pub struct FolderSyncState {
    pub folder_id: String,
    pub account_id: String,
    pub display_name: String,
    /// Opaque provider cursor. `None` means a full resync is needed.
    pub sync_token: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Oldest point before which cached history is not provably gap-free.
    /// Only advanced when a backfill page is contiguous with the already
    /// covered range.
    pub continuous_history_to: Option<DateTime<Utc>>,
}

impl FolderSyncState {
    pub fn new(folder_id: &str, account_id: &str, display_name: &str) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            account_id: account_id.to_string(),
            display_name: display_name.to_string(),
            sync_token: None,
            last_synced_at: None,
            continuous_history_to: None,
        }
    }
}

/// Message header data as delivered by the provider and cached locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub account_id: String,
    pub folder_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub has_attachments: bool,
}

/// Attachment metadata (always cached; content is fetched separately).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub attachment_id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// A fully fetched message: envelope, body text and attachment metadata.
#[derive(Debug, Clone)]
pub struct FullMessage {
    pub envelope: MessageEnvelope,
    pub body: String,
    pub attachments: Vec<AttachmentMeta>,
}
