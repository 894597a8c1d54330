//! Scripted in-memory provider for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{FullMessage, MessageEnvelope, PendingAction};
use crate::provider::{
    AttachmentContent, FolderDelta, HeaderPage, MailProvider, ProviderError,
};

/// A provider whose responses are queued up front. Each delta/page request
/// consumes the next scripted response; an exhausted script fails the call.
#[derive(Default)]
pub struct ScriptedProvider {
    pub deltas: Mutex<VecDeque<Result<FolderDelta, ProviderError>>>,
    pub pages: Mutex<VecDeque<Result<HeaderPage, ProviderError>>>,
    pub messages: Mutex<HashMap<String, Result<FullMessage, ProviderError>>>,
    pub attachments: Mutex<HashMap<String, Result<AttachmentContent, ProviderError>>>,
    pub action_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    /// Tokens passed to `fetch_folder_delta`, in call order.
    pub delta_tokens_seen: Mutex<Vec<Option<String>>>,
    /// Ids of actions successfully handed to `apply_action`, in call order.
    pub actions_applied: Mutex<Vec<i64>>,
    /// When set, every fetch call waits for one permit before responding,
    /// letting tests hold a job in flight deterministically.
    pub gate: Mutex<Option<Arc<tokio::sync::Semaphore>>>,
}

impl ScriptedProvider {
    /// Installs a gate; callers release in-flight fetches by adding permits.
    pub fn install_gate(&self) -> Arc<tokio::sync::Semaphore> {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // Consume one permit per gated call.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
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

    pub fn script_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
        result: Result<AttachmentContent, ProviderError>,
    ) {
        self.attachments
            .lock()
            .unwrap()
            .insert(format!("{message_id}/{attachment_id}"), result);
    }

    pub fn push_action_result(&self, result: Result<(), ProviderError>) {
        self.action_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl MailProvider for ScriptedProvider {
    async fn fetch_folder_delta(
        &self,
        _account_id: &str,
        _folder_id: &str,
        sync_token: Option<&str>,
    ) -> Result<FolderDelta, ProviderError> {
        self.wait_gate().await;
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
        self.wait_gate().await;
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
        self.wait_gate().await;
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
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentContent, ProviderError> {
        self.wait_gate().await;
        self.attachments
            .lock()
            .unwrap()
            .get(&format!("{message_id}/{attachment_id}"))
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Permanent("attachment not scripted".into())))
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

/// Envelope builder used across executor and controller tests.
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

/// FullMessage builder for body-fetch scripts.
pub fn full_message(id: &str, folder_id: &str, body: &str) -> FullMessage {
    FullMessage {
        envelope: envelope(id, folder_id, Utc::now()),
        body: body.to_string(),
        attachments: Vec::new(),
    }
}
