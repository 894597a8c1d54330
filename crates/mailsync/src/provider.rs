//! Provider adapter contract.
//!
//! The engine never speaks to a remote mail API directly. Executors consume
//! a [`MailProvider`] for wire operations and a [`CredentialSource`] for
//! tokens; both are injected at construction time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AttachmentMeta, FullMessage, MessageEnvelope, PendingAction};

/// Provider-normalized failure taxonomy.
///
/// Adapters must map their wire errors onto these variants; the engine's
/// retry and surfacing behavior is driven entirely by this classification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The delta cursor is expired or invalid; the caller must fall back to
    /// a full listing.
    #[error("sync token expired or invalid")]
    TokenExpired,

    /// The account needs interactive reauthentication. Never retried.
    #[error("authentication required")]
    AuthRequired,

    /// Network-level or 5xx-style failure. Retried with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider asked us to slow down.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Malformed response, resource gone, or 4xx-style failure. Not
    /// retried automatically.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether the durable retry layer should re-attempt this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }
}

/// Result of an incremental folder delta fetch.
#[derive(Debug, Clone, Default)]
pub struct FolderDelta {
    pub added: Vec<MessageEnvelope>,
    pub updated: Vec<MessageEnvelope>,
    /// Message ids removed remotely.
    pub removed: Vec<String>,
    /// Cursor to store for the next incremental fetch.
    pub next_token: String,
}

/// One page of older headers returned for a backfill request.
#[derive(Debug, Clone)]
pub struct HeaderPage {
    pub messages: Vec<MessageEnvelope>,
    /// Newest timestamp covered by this page.
    pub newest: DateTime<Utc>,
    /// Oldest timestamp covered by this page.
    pub oldest: DateTime<Utc>,
}

/// Raw attachment content plus its metadata.
#[derive(Debug, Clone)]
pub struct AttachmentContent {
    pub meta: AttachmentMeta,
    pub bytes: Vec<u8>,
}

/// Abstract wire adapter for one remote mail API.
///
/// Implementations own timeouts and HTTP mechanics; timeouts surface as
/// [`ProviderError::Transient`].
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Incremental fetch when `sync_token` is present, full listing when it
    /// is `None`.
    async fn fetch_folder_delta(
        &self,
        account_id: &str,
        folder_id: &str,
        sync_token: Option<&str>,
    ) -> Result<FolderDelta, ProviderError>;

    /// Fetches one page of headers older than `before`, for backfill.
    async fn fetch_header_page(
        &self,
        account_id: &str,
        folder_id: &str,
        before: DateTime<Utc>,
    ) -> Result<HeaderPage, ProviderError>;

    /// Fetches a full message (body and attachment metadata).
    async fn fetch_message(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<FullMessage, ProviderError>;

    /// Fetches attachment content.
    async fn fetch_attachment(
        &self,
        account_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentContent, ProviderError>;

    /// Applies a queued user mutation remotely.
    async fn apply_action(
        &self,
        account_id: &str,
        action: &PendingAction,
    ) -> Result<(), ProviderError>;
}

/// An access token for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(pub String);

/// Failure from the credential subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Interactive sign-in is required; the owning account is flagged and
    /// no jobs for it are retried until it clears.
    #[error("account '{0}' needs reauthentication")]
    NeedsReauthentication(String),
}

/// Narrow capability the engine consumes from the credential subsystem:
/// return the current token or fail.
pub trait CredentialSource: Send + Sync {
    fn token(&self, account_id: &str) -> Result<AccessToken, CredentialError>;
}

/// Credential source that always succeeds. Useful for providers that manage
/// authentication internally and for tests.
pub struct StaticCredentials;

impl CredentialSource for StaticCredentials {
    fn token(&self, _account_id: &str) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken(String::new()))
    }
}
