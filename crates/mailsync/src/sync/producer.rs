//! Job producers.
//!
//! Producers inspect local state (staleness, cache usage, outbox depth)
//! and emit candidate jobs. They are polled by the controller on a cadence
//! and on trigger events, and must be idempotent: emitting the same
//! logical job twice is safe because the controller deduplicates by
//! `(kind, target_key)`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::{DownloadPreference, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, Database};
use crate::error::EngineError;
use crate::sync::gatekeeper::CacheUsage;
use crate::sync::job::SyncJob;

/// State handed to producers on every poll.
pub struct ProducerContext {
    pub db: Database,
    pub config: SyncConfig,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub cache_usage: Arc<CacheUsage>,
    pub now: DateTime<Utc>,
}

/// A policy object emitting candidate jobs from current local state.
pub trait JobProducer: Send + Sync {
    fn name(&self) -> &'static str;
    fn produce(&self, cx: &ProducerContext) -> Result<Vec<SyncJob>, EngineError>;
}

/// Emits `FolderRefresh` for folders whose last sync is older than the
/// staleness window.
pub struct StaleFolderProducer;

impl JobProducer for StaleFolderProducer {
    fn name(&self) -> &'static str {
        "stale_folder"
    }

    fn produce(&self, cx: &ProducerContext) -> Result<Vec<SyncJob>, EngineError> {
        if !cx.connectivity.is_online() {
            return Ok(Vec::new());
        }

        let cutoff = cx.now - Duration::seconds(cx.config.policy.folder_staleness_secs);
        let jobs = db::folder_repo::stale_folders(&cx.db, cutoff)?
            .into_iter()
            .map(|folder| SyncJob::FolderRefresh {
                account_id: folder.account_id,
                folder_id: folder.folder_id,
                proactive: true,
            })
            .collect();
        Ok(jobs)
    }
}

/// Emits `HeaderBackfill` for folders whose gap-free history does not yet
/// reach the configured retention horizon.
pub struct BackfillJobProducer;

impl JobProducer for BackfillJobProducer {
    fn name(&self) -> &'static str {
        "backfill"
    }

    fn produce(&self, cx: &ProducerContext) -> Result<Vec<SyncJob>, EngineError> {
        if !cx.connectivity.is_online() {
            return Ok(Vec::new());
        }

        let horizon = cx.now - Duration::days(cx.config.retention_days);
        let jobs = db::folder_repo::folders_needing_backfill(&cx.db, horizon)?
            .into_iter()
            .map(|folder| SyncJob::HeaderBackfill {
                account_id: folder.account_id,
                folder_id: folder.folder_id,
            })
            .collect();
        Ok(jobs)
    }
}

/// Emits the single global `EvictFromCache` job when usage crosses the
/// hard limit or the eviction cadence has elapsed, whichever comes first.
pub struct CacheEvictionProducer;

impl JobProducer for CacheEvictionProducer {
    fn name(&self) -> &'static str {
        "cache_eviction"
    }

    fn produce(&self, cx: &ProducerContext) -> Result<Vec<SyncJob>, EngineError> {
        let over_hard_limit = cx.cache_usage.bytes() > cx.config.hard_limit_bytes();

        let cadence_elapsed =
            match db::meta_repo::get_timestamp(&cx.db, db::meta_repo::EVICTION_LAST_RUN)? {
                Some(last_run) => {
                    cx.now - last_run >= Duration::hours(cx.config.policy.eviction_interval_hours)
                }
                // Never ran: only pressure forces the first run.
                None => false,
            };

        if over_hard_limit || cadence_elapsed {
            Ok(vec![SyncJob::EvictFromCache])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Emits folder-level bulk download jobs when online, below the soft cache
/// threshold, and permitted by the per-content-type preference. The
/// controller expands these into fine-grained jobs at dispatch time.
pub struct BulkDownloadJobProducer;

impl BulkDownloadJobProducer {
    fn preference_allows(pref: DownloadPreference, connectivity: &ConnectivityMonitor) -> bool {
        match pref {
            DownloadPreference::Always => true,
            DownloadPreference::OnWifi => !connectivity.is_metered(),
            DownloadPreference::OnDemand => false,
        }
    }
}

impl JobProducer for BulkDownloadJobProducer {
    fn name(&self) -> &'static str {
        "bulk_download"
    }

    fn produce(&self, cx: &ProducerContext) -> Result<Vec<SyncJob>, EngineError> {
        if !cx.connectivity.is_online() {
            return Ok(Vec::new());
        }
        if cx.cache_usage.bytes() > cx.config.soft_limit_bytes() {
            return Ok(Vec::new());
        }

        let bodies_allowed =
            Self::preference_allows(cx.config.body_download, &cx.connectivity);
        let attachments_allowed =
            Self::preference_allows(cx.config.attachment_download, &cx.connectivity);
        if !bodies_allowed && !attachments_allowed {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for folder in db::folder_repo::list_all(&cx.db)? {
            if bodies_allowed
                && !db::message_repo::missing_body_ids(&cx.db, &folder.folder_id, 1)?.is_empty()
            {
                jobs.push(SyncJob::BulkFetchBodies {
                    account_id: folder.account_id.clone(),
                    folder_id: folder.folder_id.clone(),
                });
            }
            if attachments_allowed
                && !db::attachment_repo::missing_for_folder(&cx.db, &folder.folder_id, 1)?
                    .is_empty()
            {
                jobs.push(SyncJob::BulkFetchAttachments {
                    account_id: folder.account_id,
                    folder_id: folder.folder_id,
                });
            }
        }
        Ok(jobs)
    }
}

/// Emits `DrainOutbox` for every account with drainable pending actions.
pub struct OutboxJobProducer;

impl JobProducer for OutboxJobProducer {
    fn name(&self) -> &'static str {
        "outbox"
    }

    fn produce(&self, cx: &ProducerContext) -> Result<Vec<SyncJob>, EngineError> {
        if !cx.connectivity.is_online() {
            return Ok(Vec::new());
        }

        let jobs = db::outbox_repo::accounts_with_pending(&cx.db)?
            .into_iter()
            .map(|account_id| SyncJob::DrainOutbox { account_id })
            .collect();
        Ok(jobs)
    }
}

/// The standard producer set, in poll order.
pub fn standard_producers() -> Vec<Box<dyn JobProducer>> {
    vec![
        Box::new(StaleFolderProducer),
        Box::new(BackfillJobProducer),
        Box::new(CacheEvictionProducer),
        Box::new(BulkDownloadJobProducer),
        Box::new(OutboxJobProducer),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, FolderSyncState, MessageEnvelope, PendingAction};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn context(online: bool, usage_bytes: u64) -> ProducerContext {
        let mut config = SyncConfig::with_defaults(PathBuf::from("/tmp/content"));
        config.cache_budget_bytes = 1000;
        ProducerContext {
            db: Database::open_in_memory().unwrap(),
            config,
            connectivity: Arc::new(ConnectivityMonitor::new(online, false)),
            cache_usage: Arc::new(CacheUsage::new(usage_bytes)),
            now: Utc::now(),
        }
    }

    fn seed_folder(cx: &ProducerContext, id: &str, f: impl FnOnce(&mut FolderSyncState)) {
        let mut folder = FolderSyncState::new(id, "acct-1", id);
        f(&mut folder);
        db::folder_repo::upsert(&cx.db, &folder).unwrap();
    }

    #[test]
    fn test_stale_folder_producer_offline_emits_nothing() {
        let cx = context(false, 0);
        seed_folder(&cx, "inbox", |_| {});
        assert!(StaleFolderProducer.produce(&cx).unwrap().is_empty());
    }

    #[test]
    fn test_stale_folder_producer_emits_proactive_refresh() {
        let cx = context(true, 0);
        seed_folder(&cx, "inbox", |f| {
            f.last_synced_at = Some(cx.now - Duration::minutes(10))
        });
        seed_folder(&cx, "sent", |f| f.last_synced_at = Some(cx.now));

        let jobs = StaleFolderProducer.produce(&cx).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(
            &jobs[0],
            SyncJob::FolderRefresh { folder_id, proactive: true, .. } if folder_id == "inbox"
        ));
    }

    #[test]
    fn test_backfill_producer_targets_short_coverage() {
        let cx = context(true, 0);
        seed_folder(&cx, "inbox", |f| {
            f.continuous_history_to = Some(cx.now - Duration::days(30))
        });

        let jobs = BackfillJobProducer.produce(&cx).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].is_proactive());
    }

    #[test]
    fn test_eviction_producer_on_hard_pressure() {
        // 1000-byte budget; 990 bytes is above the 98% hard limit.
        let cx = context(true, 990);
        let jobs = CacheEvictionProducer.produce(&cx).unwrap();
        assert_eq!(jobs, vec![SyncJob::EvictFromCache]);
    }

    #[test]
    fn test_eviction_producer_on_cadence() {
        let cx = context(true, 0);
        db::meta_repo::set_timestamp(
            &cx.db,
            db::meta_repo::EVICTION_LAST_RUN,
            cx.now - Duration::hours(25),
        )
        .unwrap();

        let jobs = CacheEvictionProducer.produce(&cx).unwrap();
        assert_eq!(jobs, vec![SyncJob::EvictFromCache]);
    }

    #[test]
    fn test_eviction_producer_quiet_when_recent_and_unpressured() {
        let cx = context(true, 100);
        db::meta_repo::set_timestamp(
            &cx.db,
            db::meta_repo::EVICTION_LAST_RUN,
            cx.now - Duration::hours(1),
        )
        .unwrap();

        assert!(CacheEvictionProducer.produce(&cx).unwrap().is_empty());
    }

    #[test]
    fn test_bulk_producer_respects_preferences() {
        let mut cx = context(true, 0);
        cx.config.body_download = DownloadPreference::Always;
        cx.config.attachment_download = DownloadPreference::OnDemand;
        seed_folder(&cx, "inbox", |_| {});

        let env = MessageEnvelope {
            id: "m1".into(),
            account_id: "acct-1".into(),
            folder_id: "inbox".into(),
            subject: "s".into(),
            sender: "a@b".into(),
            received_at: cx.now,
            is_read: false,
            has_attachments: false,
        };
        cx.db
            .with_tx(|tx| db::message_repo::upsert_envelope_tx(tx, &env))
            .unwrap();

        let jobs = BulkDownloadJobProducer.produce(&cx).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0], SyncJob::BulkFetchBodies { .. }));
    }

    #[test]
    fn test_bulk_producer_quiet_on_metered_wifi_pref() {
        let mut cx = context(true, 0);
        cx.config.body_download = DownloadPreference::OnWifi;
        cx.config.attachment_download = DownloadPreference::OnWifi;
        cx.connectivity.set_metered(true);
        seed_folder(&cx, "inbox", |_| {});

        assert!(BulkDownloadJobProducer.produce(&cx).unwrap().is_empty());
    }

    #[test]
    fn test_bulk_producer_quiet_under_cache_pressure() {
        // Above the 900-byte soft limit.
        let cx = context(true, 950);
        seed_folder(&cx, "inbox", |_| {});
        assert!(BulkDownloadJobProducer.produce(&cx).unwrap().is_empty());
    }

    #[test]
    fn test_outbox_producer_emits_per_account() {
        let cx = context(true, 0);
        for account in ["acct-1", "acct-2"] {
            db::outbox_repo::enqueue(
                &cx.db,
                &PendingAction::new(account, ActionType::MarkRead, "m1", BTreeMap::new()),
            )
            .unwrap();
        }

        let jobs = OutboxJobProducer.produce(&cx).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs
            .iter()
            .all(|j| matches!(j, SyncJob::DrainOutbox { .. })));
    }
}
