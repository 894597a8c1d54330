//! Shared test utilities for mailsync integration tests.
//!
//! Provides a scripted fake provider and builders for seeding the local
//! cache, so flows can be driven end to end without a real mail server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailsync::models::{FolderSyncState, FullMessage, MessageEnvelope, PendingAction};
use mailsync::provider::{
    AttachmentContent, FolderDelta, HeaderPage, MailProvider, ProviderError, StaticCredentials,
};
use mailsync::{Database, MailSyncEngine, SyncConfig};

/// Provider whose responses are queued per call site.
#[derive(Default)]
pub struct FakeProvider {
    pub deltas: Mutex<VecDeque<Result<FolderDelta, ProviderError>>>,
    pub pages: Mutex<VecDeque<Result<HeaderPage, ProviderError>>>,
    pub messages: Mutex<HashMap<String, Result<FullMessage, ProviderError>>>,
    pub action_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    pub delta_tokens_seen: Mutex<Vec<Option<String>>>,
    pub actions_applied: Mutex<Vec<i64>>,
}

impl FakeProvider {
    pub fn push_delta(&self, result: Result<FolderDelta, ProviderError>) {
        self.deltas.lock().unwrap().push_back(result);
    }

    pub fn push_page(&self, result: Result<HeaderPage, ProviderError>) {
        self.pages.lock().unwrap().push_back(result);
    }

    pub fn script_message(&self, message_id: &str, result: Result<FullMessage, ProviderError>) {
        self.messages
            .lock()
            .unwrap()
            .insert(message_id.to_string(), result);
    }

    pub fn push_action_result(&self, result: Result<(), ProviderError>) {
        self.action_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn fetch_folder_delta(
        &self,
        _account_id: &str,
        _folder_id: &str,
        sync_token: Option<&str>,
    ) -> Result<FolderDelta, ProviderError> {
        self.delta_tokens_seen
            .lock()
            .unwrap()
            .push(sync_token.map(str::to_string));
        self.deltas
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transient("delta script exhausted".into())))
    }

    async fn fetch_header_page(
        &self,
        _account_id: &str,
        _folder_id: &str,
        _before: DateTime<Utc>,
    ) -> Result<HeaderPage, ProviderError> {
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transient("page script exhausted".into())))
    }

    async fn fetch_message(
        &self,
        _account_id: &str,
        message_id: &str,
    ) -> Result<FullMessage, ProviderError> {
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Permanent("message not scripted".into())))
    }

    async fn fetch_attachment(
        &self,
        _account_id: &str,
        _message_id: &str,
        _attachment_id: &str,
    ) -> Result<AttachmentContent, ProviderError> {
        Err(ProviderError::Permanent("attachment not scripted".into()))
    }

    async fn apply_action(
        &self,
        _account_id: &str,
        action: &PendingAction,
    ) -> Result<(), ProviderError> {
        let result = self
            .action_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            self.actions_applied.lock().unwrap().push(action.id);
        }
        result
    }
}

/// An engine over an in-memory store, a temp content dir and the fake
/// provider. The temp dir must outlive the engine.
pub struct TestHarness {
    pub engine: MailSyncEngine,
    pub provider: Arc<FakeProvider>,
    _content_dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut SyncConfig)) -> Self {
        let content_dir = tempfile::tempdir().expect("Failed to create temp content dir");
        let mut config = SyncConfig::with_defaults(content_dir.path().to_path_buf());
        tweak(&mut config);
        let provider = Arc::new(FakeProvider::default());
        let engine = MailSyncEngine::new(
            Database::open_in_memory().expect("Failed to open test database"),
            config,
            provider.clone(),
            Arc::new(StaticCredentials),
        )
        .expect("Failed to build engine");
        Self {
            engine,
            provider,
            _content_dir: content_dir,
        }
    }

    pub fn db(&self) -> &Database {
        self.engine.database()
    }

    pub fn seed_folder(&self, folder_id: &str, token: Option<&str>) {
        let mut folder = FolderSyncState::new(folder_id, "acct-1", folder_id);
        folder.sync_token = token.map(str::to_string);
        mailsync::db::folder_repo::upsert(self.db(), &folder)
            .expect("Failed to seed folder");
    }
}

pub fn envelope(id: &str, folder_id: &str, received_at: DateTime<Utc>) -> MessageEnvelope {
    MessageEnvelope {
        id: id.to_string(),
        account_id: "acct-1".to_string(),
        folder_id: folder_id.to_string(),
        subject: format!("subject {id}"),
        sender: "alice@example.com".to_string(),
        received_at,
        is_read: false,
        has_attachments: false,
    }
}

pub fn full_message(id: &str, folder_id: &str, body: &str) -> FullMessage {
    FullMessage {
        envelope: envelope(id, folder_id, Utc::now()),
        body: body.to_string(),
        attachments: Vec::new(),
    }
}

pub fn delta(added: Vec<MessageEnvelope>, next_token: &str) -> FolderDelta {
    FolderDelta {
        added,
        updated: vec![],
        removed: vec![],
        next_token: next_token.to_string(),
    }
}
