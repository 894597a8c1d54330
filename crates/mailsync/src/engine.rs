//! Engine facade.
//!
//! Wires the database, controller and scheduler together and exposes the
//! user-triggered entry points: opening a message, requesting an
//! attachment, refreshing a folder, enqueueing an offline mutation. Every
//! entry point is a non-proactive admission, so it bypasses cache-pressure
//! vetoes and supersedes any background job on the same key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::broadcast::{SyncStatus, SyncStatusBroadcaster};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, Database};
use crate::error::{EngineError, Result};
use crate::models::{ActionType, EntitySyncStatus, MessageEnvelope, PendingAction};
use crate::provider::{CredentialSource, MailProvider};
use crate::sync::controller::{NoopPriorityHook, PriorityHook};
use crate::sync::{AdmitOutcome, SyncController, SyncJob, SyncScheduler};

/// A locally cached message as the presentation layer sees it: the
/// envelope always, the body only while its content is cached.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub envelope: MessageEnvelope,
    pub body: Option<String>,
    pub sync_status: EntitySyncStatus,
}

pub struct MailSyncEngine {
    db: Database,
    controller: Arc<SyncController>,
    scheduler: SyncScheduler,
    connectivity: Arc<ConnectivityMonitor>,
    trigger_tx: broadcast::Sender<()>,
    loop_handle: Option<JoinHandle<()>>,
}

impl MailSyncEngine {
    pub fn new(
        db: Database,
        config: SyncConfig,
        provider: Arc<dyn MailProvider>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        Self::with_priority_hook(db, config, provider, credentials, Arc::new(NoopPriorityHook))
    }

    pub fn with_priority_hook(
        db: Database,
        config: SyncConfig,
        provider: Arc<dyn MailProvider>,
        credentials: Arc<dyn CredentialSource>,
        priority: Arc<dyn PriorityHook>,
    ) -> Result<Self> {
        let connectivity = Arc::new(ConnectivityMonitor::new(true, false));
        let interval = Duration::from_secs(config.policy.folder_staleness_secs.max(1) as u64);
        let controller = Arc::new(SyncController::new(
            db.clone(),
            config,
            provider,
            credentials,
            connectivity.clone(),
            priority,
        )?);
        let scheduler = SyncScheduler::new(controller.clone(), interval);
        let (trigger_tx, _) = broadcast::channel(16);

        Ok(Self {
            db,
            controller,
            scheduler,
            connectivity,
            trigger_tx,
            loop_handle: None,
        })
    }

    /// Starts the background scheduling loop. Idempotent.
    pub fn start(&mut self) {
        if self.loop_handle.is_none() {
            self.loop_handle = Some(self.scheduler.start(self.trigger_tx.subscribe()));
        }
    }

    /// Stops the loop and waits for it to exit.
    pub fn stop(&mut self) {
        self.scheduler.stop();
        let _ = self.trigger_tx.send(());
        if let Some(handle) = self.loop_handle.take() {
            if handle.join().is_err() {
                log::error!("Sync loop thread panicked");
            }
        }
    }

    /// Requests an immediate scheduling cycle.
    pub fn trigger_sync(&self) {
        let _ = self.trigger_tx.send(());
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn controller(&self) -> &Arc<SyncController> {
        &self.controller
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.controller.subscribe_status()
    }

    pub fn status_broadcaster(&self) -> SyncStatusBroadcaster {
        self.controller.status_broadcaster()
    }

    /// Reports a connectivity change and wakes the scheduler so queued
    /// work resumes promptly when the network returns.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
        if online {
            self.trigger_sync();
        }
    }

    /// Opens a message: returns what is cached, records the access for
    /// eviction protection, and admits a user-priority body fetch when
    /// the content is missing.
    pub fn open_message(&self, message_id: &str) -> Result<Option<CachedMessage>> {
        let Some(envelope) = db::message_repo::get_envelope(&self.db, message_id)? else {
            return Ok(None);
        };
        let body = db::message_repo::body_content(&self.db, message_id)?;
        let sync_status = db::message_repo::sync_status(&self.db, message_id)?
            .unwrap_or(EntitySyncStatus::Idle);

        if body.is_some() {
            db::message_repo::touch_body_access(&self.db, message_id, chrono::Utc::now())?;
        } else {
            self.controller.admit(SyncJob::FetchFullMessageBody {
                account_id: envelope.account_id.clone(),
                message_id: message_id.to_string(),
                proactive: false,
            })?;
        }

        Ok(Some(CachedMessage {
            envelope,
            body,
            sync_status,
        }))
    }

    /// Requests an attachment: returns the local path when downloaded,
    /// otherwise admits a user-priority download and returns `None`.
    pub fn request_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Option<String>> {
        let row = db::attachment_repo::get(&self.db, message_id, attachment_id)?;
        if let Some(row) = &row {
            if let Some(path) = &row.local_path {
                let now = chrono::Utc::now();
                db::attachment_repo::touch_access(&self.db, message_id, attachment_id, now)?;
                return Ok(Some(path.clone()));
            }
        }

        let Some(envelope) = db::message_repo::get_envelope(&self.db, message_id)? else {
            return Err(EngineError::Controller(format!(
                "attachment requested for unknown message '{message_id}'"
            )));
        };
        self.controller.admit(SyncJob::DownloadAttachment {
            account_id: envelope.account_id,
            message_id: message_id.to_string(),
            attachment_id: attachment_id.to_string(),
            proactive: false,
        })?;
        Ok(None)
    }

    /// User-triggered folder refresh (pull to refresh, folder opened).
    pub fn refresh_folder(&self, account_id: &str, folder_id: &str) -> Result<AdmitOutcome> {
        self.controller.admit(SyncJob::FolderRefresh {
            account_id: account_id.to_string(),
            folder_id: folder_id.to_string(),
            proactive: false,
        })
    }

    /// Records a user mutation in the outbox and starts a drain. The
    /// entity is flagged `PendingUpload` in the same transaction, so the
    /// local change and its pending state are never observed apart.
    pub fn enqueue_action(
        &self,
        account_id: &str,
        action_type: ActionType,
        entity_id: &str,
        payload: BTreeMap<String, String>,
    ) -> Result<i64> {
        let action = PendingAction::new(account_id, action_type, entity_id, payload);
        let id = self.db.with_tx(|tx| {
            let id = db::outbox_repo::enqueue_tx(tx, &action)?;
            db::message_repo::set_sync_status_tx(tx, entity_id, EntitySyncStatus::PendingUpload)?;
            Ok(id)
        })?;

        self.controller.admit(SyncJob::DrainOutbox {
            account_id: account_id.to_string(),
        })?;
        Ok(id)
    }

    /// Re-arms a dead-lettered action after the user chose to retry it.
    pub fn retry_failed_action(&self, action_id: i64) -> Result<()> {
        let Some(action) = db::outbox_repo::get(&self.db, action_id)? else {
            return Err(EngineError::Controller(format!(
                "unknown outbox action {action_id}"
            )));
        };
        db::outbox_repo::reset_for_retry(&self.db, action_id)?;
        self.controller.admit(SyncJob::DrainOutbox {
            account_id: action.account_id,
        })?;
        Ok(())
    }
}

impl Drop for MailSyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
