//! Engine configuration.
//!
//! User-facing settings (cache budget, history horizon, download
//! preferences) plus the tunable policy constants that drive scheduling.
//! Loaded from JSON and validated before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// When proactive content downloads are allowed, per content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPreference {
    /// Download whenever online.
    Always,
    /// Download only on an unmetered connection.
    OnWifi,
    /// Never download proactively; fetch only when the user opens the item.
    OnDemand,
}

/// Tunable policy constants. The defaults are sensible starting points,
/// not contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Fraction of the cache budget above which proactive downloads are
    /// vetoed.
    pub cache_soft_ratio: f64,
    /// Fraction of the cache budget above which eviction is forced.
    pub cache_hard_ratio: f64,
    /// Work score above which elevated execution priority is requested.
    pub promote_score: u32,
    /// How long the work score must stay at zero before elevated priority
    /// is released.
    pub promote_debounce_ms: u64,
    /// Cached content older than this is an eviction candidate.
    pub eviction_age_days: i64,
    /// Content accessed within this window is never evicted.
    pub eviction_access_hours: i64,
    /// Eviction also runs on this cadence regardless of pressure.
    pub eviction_interval_hours: i64,
    /// A folder not synced within this window is considered stale.
    pub folder_staleness_secs: i64,
    /// Bounded retries for transient executor failures.
    pub max_retries: u32,
    /// Base delay for the exponential retry backoff.
    pub retry_backoff_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_soft_ratio: 0.90,
            cache_hard_ratio: 0.98,
            promote_score: 10,
            promote_debounce_ms: 5_000,
            eviction_age_days: 90,
            eviction_access_hours: 24,
            eviction_interval_hours: 24,
            folder_staleness_secs: 300,
            max_retries: 3,
            retry_backoff_ms: 30_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Total byte budget for cached content (bodies + attachment files).
    pub cache_budget_bytes: u64,
    /// How far back header history should eventually reach.
    pub retention_days: i64,
    /// Proactive download preference for message bodies.
    #[serde(default = "default_body_download")]
    pub body_download: DownloadPreference,
    /// Proactive download preference for attachments.
    #[serde(default = "default_attachment_download")]
    pub attachment_download: DownloadPreference,
    /// Directory where downloaded attachment content is stored.
    pub content_dir: PathBuf,
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_body_download() -> DownloadPreference {
    DownloadPreference::Always
}

fn default_attachment_download() -> DownloadPreference {
    DownloadPreference::OnWifi
}

impl SyncConfig {
    /// A usable default rooted in the user's home directory.
    pub fn with_defaults(content_dir: PathBuf) -> Self {
        Self {
            cache_budget_bytes: 500 * 1024 * 1024,
            retention_days: 365,
            body_download: default_body_download(),
            attachment_download: default_attachment_download(),
            content_dir,
            policy: PolicyConfig::default(),
        }
    }

    /// Cache bytes above which proactive downloads are vetoed.
    pub fn soft_limit_bytes(&self) -> u64 {
        (self.cache_budget_bytes as f64 * self.policy.cache_soft_ratio) as u64
    }

    /// Cache bytes above which eviction is forced.
    pub fn hard_limit_bytes(&self) -> u64 {
        (self.cache_budget_bytes as f64 * self.policy.cache_hard_ratio) as u64
    }
}

/// Returns the canonical content directory: `~/.mailsync/content`.
pub fn default_content_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mailsync").join("content"))
}

/// Loads and validates a configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SyncConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Parses and validates a configuration from a JSON string.
pub fn load_config_from_str(content: &str) -> Result<SyncConfig, ConfigError> {
    let config: SyncConfig = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &SyncConfig) -> Result<(), ConfigError> {
    if config.cache_budget_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "cache_budget_bytes must be greater than zero".to_string(),
        });
    }

    if config.retention_days <= 0 {
        return Err(ConfigError::Validation {
            message: "retention_days must be greater than zero".to_string(),
        });
    }

    let policy = &config.policy;
    if !(0.0..=1.0).contains(&policy.cache_soft_ratio)
        || !(0.0..=1.0).contains(&policy.cache_hard_ratio)
    {
        return Err(ConfigError::Validation {
            message: "cache pressure ratios must be between 0.0 and 1.0".to_string(),
        });
    }

    if policy.cache_soft_ratio > policy.cache_hard_ratio {
        return Err(ConfigError::Validation {
            message: format!(
                "cache_soft_ratio ({}) must not exceed cache_hard_ratio ({})",
                policy.cache_soft_ratio, policy.cache_hard_ratio
            ),
        });
    }

    if policy.eviction_age_days < 0 || policy.eviction_access_hours < 0 {
        return Err(ConfigError::Validation {
            message: "eviction windows must not be negative".to_string(),
        });
    }

    Ok(())
}
