//! Sync job model.
//!
//! A [`SyncJob`] is an immutable description of one unit of synchronization
//! work. Jobs are deduplicated and single-flighted by `(kind, target_key)`;
//! the work score is a relative cost unit driving the controller's
//! visibility heuristics, not wall-clock time.

use serde::{Deserialize, Serialize};

/// Job kind, used for executor dispatch and dedupe keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FolderRefresh,
    HeaderBackfill,
    FetchBody,
    DownloadAttachment,
    BulkFetchBodies,
    BulkFetchAttachments,
    EvictFromCache,
    DrainOutbox,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FolderRefresh => "folder_refresh",
            JobKind::HeaderBackfill => "header_backfill",
            JobKind::FetchBody => "fetch_body",
            JobKind::DownloadAttachment => "download_attachment",
            JobKind::BulkFetchBodies => "bulk_fetch_bodies",
            JobKind::BulkFetchAttachments => "bulk_fetch_attachments",
            JobKind::EvictFromCache => "evict_from_cache",
            JobKind::DrainOutbox => "drain_outbox",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of synchronization work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum SyncJob {
    /// Forward delta sync of one folder.
    FolderRefresh {
        account_id: String,
        folder_id: String,
        /// False when the user explicitly asked for a refresh.
        proactive: bool,
    },
    /// Extend cached header history further into the past. Always
    /// opportunistic.
    HeaderBackfill {
        account_id: String,
        folder_id: String,
    },
    /// Fetch one message body (and attachment metadata).
    FetchFullMessageBody {
        account_id: String,
        message_id: String,
        /// False when the user opened the message.
        proactive: bool,
    },
    /// Download one attachment's content.
    DownloadAttachment {
        account_id: String,
        message_id: String,
        attachment_id: String,
        proactive: bool,
    },
    /// Expanded by the controller into per-message body fetches.
    BulkFetchBodies {
        account_id: String,
        folder_id: String,
    },
    /// Expanded by the controller into per-attachment downloads.
    BulkFetchAttachments {
        account_id: String,
        folder_id: String,
    },
    /// Global cache eviction run. Singleton, no account scope.
    EvictFromCache,
    /// Apply queued user mutations for one account, in FIFO order.
    DrainOutbox { account_id: String },
}

impl SyncJob {
    pub fn kind(&self) -> JobKind {
        match self {
            SyncJob::FolderRefresh { .. } => JobKind::FolderRefresh,
            SyncJob::HeaderBackfill { .. } => JobKind::HeaderBackfill,
            SyncJob::FetchFullMessageBody { .. } => JobKind::FetchBody,
            SyncJob::DownloadAttachment { .. } => JobKind::DownloadAttachment,
            SyncJob::BulkFetchBodies { .. } => JobKind::BulkFetchBodies,
            SyncJob::BulkFetchAttachments { .. } => JobKind::BulkFetchAttachments,
            SyncJob::EvictFromCache => JobKind::EvictFromCache,
            SyncJob::DrainOutbox { .. } => JobKind::DrainOutbox,
        }
    }

    /// The logical target this job operates on. At most one job per
    /// `(kind, target_key)` is in flight at a time.
    pub fn target_key(&self) -> String {
        match self {
            SyncJob::FolderRefresh {
                account_id,
                folder_id,
                ..
            }
            | SyncJob::HeaderBackfill {
                account_id,
                folder_id,
            }
            | SyncJob::BulkFetchBodies {
                account_id,
                folder_id,
            }
            | SyncJob::BulkFetchAttachments {
                account_id,
                folder_id,
            } => format!("{}/{}", account_id, folder_id),
            SyncJob::FetchFullMessageBody {
                account_id,
                message_id,
                ..
            } => format!("{}/{}", account_id, message_id),
            SyncJob::DownloadAttachment {
                account_id,
                message_id,
                attachment_id,
                ..
            } => format!("{}/{}/{}", account_id, message_id, attachment_id),
            SyncJob::EvictFromCache => "global".to_string(),
            SyncJob::DrainOutbox { account_id } => account_id.clone(),
        }
    }

    /// Deduplication key for the scheduler and the persisted queue.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.kind(), self.target_key())
    }

    /// Relative cost of this job. Fixed per kind; bulk jobs are priced for
    /// the fan-out they trigger.
    pub fn work_score(&self) -> u32 {
        match self {
            SyncJob::FolderRefresh { .. } => 2,
            SyncJob::HeaderBackfill { .. } => 5,
            SyncJob::FetchFullMessageBody { .. } => 1,
            SyncJob::DownloadAttachment { .. } => 2,
            SyncJob::BulkFetchBodies { .. } => 8,
            SyncJob::BulkFetchAttachments { .. } => 8,
            SyncJob::EvictFromCache => 1,
            SyncJob::DrainOutbox { .. } => 2,
        }
    }

    /// True only for opportunistic, non-user-triggered fetches. Proactive
    /// jobs are subject to cache-pressure vetoes; user jobs never are.
    pub fn is_proactive(&self) -> bool {
        match self {
            SyncJob::FolderRefresh { proactive, .. }
            | SyncJob::FetchFullMessageBody { proactive, .. }
            | SyncJob::DownloadAttachment { proactive, .. } => *proactive,
            SyncJob::HeaderBackfill { .. }
            | SyncJob::BulkFetchBodies { .. }
            | SyncJob::BulkFetchAttachments { .. } => true,
            SyncJob::EvictFromCache | SyncJob::DrainOutbox { .. } => false,
        }
    }

    /// Whether this job needs connectivity. Everything except eviction.
    pub fn requires_network(&self) -> bool {
        !matches!(self, SyncJob::EvictFromCache)
    }

    /// Owning account, `None` for the global eviction job.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            SyncJob::FolderRefresh { account_id, .. }
            | SyncJob::HeaderBackfill { account_id, .. }
            | SyncJob::FetchFullMessageBody { account_id, .. }
            | SyncJob::DownloadAttachment { account_id, .. }
            | SyncJob::BulkFetchBodies { account_id, .. }
            | SyncJob::BulkFetchAttachments { account_id, .. }
            | SyncJob::DrainOutbox { account_id } => Some(account_id),
            SyncJob::EvictFromCache => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backfill() -> SyncJob {
        SyncJob::HeaderBackfill {
            account_id: "acct-1".into(),
            folder_id: "inbox".into(),
        }
    }

    #[test]
    fn test_dedupe_key_distinguishes_kinds_on_same_target() {
        let refresh = SyncJob::FolderRefresh {
            account_id: "acct-1".into(),
            folder_id: "inbox".into(),
            proactive: true,
        };
        assert_eq!(refresh.target_key(), backfill().target_key());
        assert_ne!(refresh.dedupe_key(), backfill().dedupe_key());
    }

    #[test]
    fn test_eviction_is_global_singleton() {
        let evict = SyncJob::EvictFromCache;
        assert_eq!(evict.target_key(), "global");
        assert_eq!(evict.account_id(), None);
        assert!(!evict.requires_network());
        assert!(!evict.is_proactive());
    }

    #[test]
    fn test_proactive_flags() {
        assert!(backfill().is_proactive());
        let user_fetch = SyncJob::FetchFullMessageBody {
            account_id: "acct-1".into(),
            message_id: "m1".into(),
            proactive: false,
        };
        assert!(!user_fetch.is_proactive());
        assert!(SyncJob::BulkFetchBodies {
            account_id: "acct-1".into(),
            folder_id: "inbox".into(),
        }
        .is_proactive());
    }

    #[test]
    fn test_network_requirement() {
        assert!(backfill().requires_network());
        assert!(SyncJob::DrainOutbox {
            account_id: "acct-1".into()
        }
        .requires_network());
    }

    #[test]
    fn test_job_serialization_round_trip() {
        let job = SyncJob::DownloadAttachment {
            account_id: "acct-1".into(),
            message_id: "m1".into(),
            attachment_id: "a1".into(),
            proactive: true,
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: SyncJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
