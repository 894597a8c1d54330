//! Cache eviction executor.
//!
//! Clears content only: body text goes NULL, attachment files are removed
//! and their state returns to `NotDownloaded`. Metadata rows stay queryable
//! so the presentation layer never loses headers to the budget.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::db::{attachment_repo, message_repo, meta_repo};
use crate::sync::job::SyncJob;

use super::{ExecContext, ExecError, JobExecutor};

const BATCH_SIZE: u32 = 50;

/// What one eviction run freed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub evicted_bodies: usize,
    pub evicted_attachments: usize,
    pub freed_bytes: u64,
}

pub struct EvictExecutor;

#[async_trait]
impl JobExecutor for EvictExecutor {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
        if !matches!(job, SyncJob::EvictFromCache) {
            return Err(ExecError::Permanent(format!(
                "evict executor received {}",
                job.dedupe_key()
            )));
        }
        let outcome = run_eviction(ctx)?;
        if outcome.evicted_bodies > 0 || outcome.evicted_attachments > 0 {
            log::info!(
                "Evicted {} bodies and {} attachments, freed {} bytes",
                outcome.evicted_bodies,
                outcome.evicted_attachments,
                outcome.freed_bytes
            );
        }
        Ok(())
    }
}

/// Evicts in batches until usage is back under the soft limit or no
/// candidate remains. Only content older than the retention window and not
/// accessed within the access window is eligible. Always records the run
/// timestamp, including runs that evict nothing.
pub fn run_eviction(ctx: &ExecContext) -> Result<EvictionOutcome, ExecError> {
    let policy = &ctx.config.policy;
    let now = Utc::now();
    let older_than = now - Duration::days(policy.eviction_age_days);
    let not_accessed_since = now - Duration::hours(policy.eviction_access_hours);
    let soft_limit = ctx.config.soft_limit_bytes();

    let mut outcome = EvictionOutcome::default();
    loop {
        ctx.check_cancelled()?;
        let usage = message_repo::cache_usage_bytes(&ctx.db)?;
        if usage <= soft_limit {
            break;
        }

        let bodies =
            message_repo::evictable_bodies(&ctx.db, older_than, not_accessed_since, BATCH_SIZE)?;
        let attachments =
            attachment_repo::evictable(&ctx.db, older_than, not_accessed_since, BATCH_SIZE)?;
        if bodies.is_empty() && attachments.is_empty() {
            log::warn!(
                "Cache at {} bytes exceeds soft limit of {} but no content is eligible for eviction",
                usage,
                soft_limit
            );
            break;
        }

        for attachment in &attachments {
            if let Some(path) = &attachment.local_path {
                if let Err(err) = std::fs::remove_file(path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove evicted attachment file {}: {}", path, err);
                    }
                }
            }
        }

        ctx.db.with_tx(|tx| {
            for body in &bodies {
                message_repo::clear_body_content_tx(tx, &body.message_id)?;
            }
            for attachment in &attachments {
                attachment_repo::clear_content_tx(
                    tx,
                    &attachment.message_id,
                    &attachment.attachment_id,
                )?;
            }
            Ok(())
        })?;

        outcome.evicted_bodies += bodies.len();
        outcome.evicted_attachments += attachments.len();
        outcome.freed_bytes += bodies.iter().map(|b| b.size_bytes).sum::<u64>()
            + attachments.iter().map(|a| a.size_bytes).sum::<u64>();
    }

    meta_repo::set_timestamp(&ctx.db, meta_repo::EVICTION_LAST_RUN, now)?;
    Ok(outcome)
}
