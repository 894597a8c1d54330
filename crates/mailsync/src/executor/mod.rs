//! Job executors.
//!
//! One executor per job kind. Every executor is idempotent under
//! at-least-once redelivery, checks for cooperative cancellation before and
//! after each suspension point, and performs exactly one local-store
//! transaction per successful remote fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::db::{Database, DatabaseError};
use crate::provider::{CredentialError, CredentialSource, MailProvider, ProviderError};
use crate::sync::job::SyncJob;

pub mod attachment;
pub mod evict;
pub mod folder;
pub mod message;
pub mod outbox;

/// Classified executor failure. Drives the controller's retry and
/// surfacing behavior.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Cooperative cancellation. Not an error; discarded silently.
    #[error("cancelled")]
    Cancelled,

    /// Retried automatically by the durable queue layer with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retried after the provider-suggested delay.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The owning account needs interactive reauthentication. Never
    /// retried automatically.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Target marked `Error`; retried only on user request.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ExecError {
    /// Whether the queue layer should reschedule this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::Transient(_) | ExecError::RateLimited { .. } | ExecError::Database(_)
        )
    }
}

impl From<ProviderError> for ExecError {
    fn from(err: ProviderError) -> Self {
        match err {
            // Token expiry is handled inside the folder executor; anywhere
            // else it degrades to a retryable failure.
            ProviderError::TokenExpired => ExecError::Transient("sync token expired".to_string()),
            ProviderError::AuthRequired => {
                ExecError::AuthRequired("provider rejected credentials".to_string())
            }
            ProviderError::Transient(msg) => ExecError::Transient(msg),
            ProviderError::RateLimited { retry_after_secs } => {
                ExecError::RateLimited { retry_after_secs }
            }
            ProviderError::Permanent(msg) => ExecError::Permanent(msg),
        }
    }
}

impl From<CredentialError> for ExecError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NeedsReauthentication(account) => ExecError::AuthRequired(account),
        }
    }
}

/// Collaborators and the cancellation flag handed to an executor
/// invocation.
pub struct ExecContext {
    pub db: Database,
    pub provider: Arc<dyn MailProvider>,
    pub credentials: Arc<dyn CredentialSource>,
    pub config: SyncConfig,
    cancel: Arc<AtomicBool>,
}

impl ExecContext {
    pub fn new(
        db: Database,
        provider: Arc<dyn MailProvider>,
        credentials: Arc<dyn CredentialSource>,
        config: SyncConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            provider,
            credentials,
            config,
            cancel,
        }
    }

    /// Returns `ExecError::Cancelled` once the controller has superseded
    /// this invocation. Called before and after every suspension point;
    /// nothing may be committed after it fails.
    pub fn check_cancelled(&self) -> Result<(), ExecError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }
}

/// One idempotent unit of work bound to a single job kind.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError>;
}

/// Dispatches a job to the executor for its kind. Bulk jobs never reach
/// this point; the controller expands them at dispatch time.
pub async fn run_job(job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
    match job {
        SyncJob::FolderRefresh { .. } => folder::FolderRefreshExecutor.execute(job, ctx).await,
        SyncJob::HeaderBackfill { .. } => folder::HeaderBackfillExecutor.execute(job, ctx).await,
        SyncJob::FetchFullMessageBody { .. } => {
            message::MessageBodyExecutor.execute(job, ctx).await
        }
        SyncJob::DownloadAttachment { .. } => {
            attachment::AttachmentExecutor.execute(job, ctx).await
        }
        SyncJob::EvictFromCache => evict::EvictExecutor.execute(job, ctx).await,
        SyncJob::DrainOutbox { .. } => outbox::OutboxExecutor.execute(job, ctx).await,
        SyncJob::BulkFetchBodies { .. } | SyncJob::BulkFetchAttachments { .. } => Err(
            ExecError::Permanent(format!("bulk job reached executor: {}", job.dedupe_key())),
        ),
    }
}
