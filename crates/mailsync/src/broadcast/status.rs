//! Sync status broadcaster.
//!
//! The controller is the single writer; the presentation layer and
//! diagnostics subscribe. Each event is a full snapshot, so a late
//! subscriber only needs the most recent one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Classification of a surfaced failure. Offline and auth-required states
/// are deliberately distinct from generic sync errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Offline,
    AuthRequired,
    Transient,
    Permanent,
}

/// The most recent unresolved, user-relevant failure for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub account_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Coarse engine status surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// True while any admitted job is still active (work score above
    /// zero).
    pub is_syncing: bool,
    pub network_available: bool,
    /// At most one active failure per account; this is the most recent
    /// across accounts, cleared by the next successful cycle for that
    /// account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncFailure>,
}

impl SyncStatus {
    pub fn idle(network_available: bool) -> Self {
        Self {
            is_syncing: false,
            network_available,
            error: None,
        }
    }
}

/// Broadcasts status snapshots to all subscribers.
#[derive(Clone)]
pub struct SyncStatusBroadcaster {
    sender: Arc<broadcast::Sender<SyncStatus>>,
}

impl SyncStatusBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a snapshot to all subscribers.
    pub fn send(&self, status: SyncStatus) {
        // No active receivers is fine.
        let _ = self.sender.send(status);
    }

    /// Creates a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.sender.subscribe()
    }
}

impl Default for SyncStatusBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_receive() {
        let broadcaster = SyncStatusBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(SyncStatus {
            is_syncing: true,
            network_available: true,
            error: None,
        });

        let status = rx.try_recv().unwrap();
        assert!(status.is_syncing);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_error_snapshot_serializes_kind_distinctly() {
        let offline = SyncStatus {
            is_syncing: false,
            network_available: false,
            error: Some(SyncFailure {
                account_id: "acct-1".into(),
                kind: FailureKind::Offline,
                message: "offline".into(),
                at: Utc::now(),
            }),
        };
        let auth = SyncStatus {
            is_syncing: false,
            network_available: true,
            error: Some(SyncFailure {
                account_id: "acct-1".into(),
                kind: FailureKind::AuthRequired,
                message: "sign in again".into(),
                at: Utc::now(),
            }),
        };

        let offline_json = serde_json::to_string(&offline).unwrap();
        let auth_json = serde_json::to_string(&auth).unwrap();
        assert!(offline_json.contains("\"offline\""));
        assert!(auth_json.contains("\"auth_required\""));
    }

    #[test]
    fn test_send_without_receivers_is_fine() {
        let broadcaster = SyncStatusBroadcaster::default();
        broadcaster.send(SyncStatus::idle(true));
    }
}
