pub mod broadcast;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod models;
pub mod provider;
pub mod sync;

#[cfg(test)]
mod provider_test_support;

pub use broadcast::{FailureKind, SyncFailure, SyncStatus, SyncStatusBroadcaster};
pub use config::{load_config, DownloadPreference, PolicyConfig, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use db::Database;
pub use engine::{CachedMessage, MailSyncEngine};
pub use error::{ConfigError, EngineError, Result};
pub use provider::{
    AccessToken, CredentialError, CredentialSource, MailProvider, ProviderError,
};
pub use sync::{AdmitOutcome, PriorityHook, SyncController, SyncJob, SyncScheduler};
