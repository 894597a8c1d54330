//! Folder executors: forward delta refresh and historical header backfill.

use async_trait::async_trait;
use chrono::Utc;

use crate::db::{folder_repo, message_repo};
use crate::provider::ProviderError;
use crate::sync::job::SyncJob;

use super::{ExecContext, ExecError, JobExecutor};

/// Applies one provider delta to the cache: incremental when a sync token is
/// stored, full listing otherwise. A `TokenExpired` answer drops the token
/// and re-runs as a full listing in the same invocation.
pub struct FolderRefreshExecutor;

#[async_trait]
impl JobExecutor for FolderRefreshExecutor {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
        let SyncJob::FolderRefresh {
            account_id,
            folder_id,
            ..
        } = job
        else {
            return Err(ExecError::Permanent(format!(
                "folder refresh executor received {}",
                job.dedupe_key()
            )));
        };

        ctx.check_cancelled()?;
        ctx.credentials.token(account_id)?;
        let state = folder_repo::get(&ctx.db, folder_id)?
            .ok_or_else(|| ExecError::Permanent(format!("unknown folder '{folder_id}'")))?;

        let mut full_listing = state.sync_token.is_none();
        let delta = match ctx
            .provider
            .fetch_folder_delta(account_id, folder_id, state.sync_token.as_deref())
            .await
        {
            Ok(delta) => delta,
            Err(ProviderError::TokenExpired) => {
                log::warn!(
                    "Sync token for folder '{}' expired, falling back to full listing",
                    folder_id
                );
                folder_repo::clear_token(&ctx.db, folder_id)?;
                ctx.check_cancelled()?;
                full_listing = true;
                ctx.provider
                    .fetch_folder_delta(account_id, folder_id, None)
                    .await?
            }
            Err(err) => return Err(err.into()),
        };
        ctx.check_cancelled()?;

        let now = Utc::now();
        // A full listing restarts continuity from now; backfill re-covers
        // older history from there. Incremental syncs keep the marker.
        let marker = if full_listing {
            Some(now)
        } else {
            state.continuous_history_to
        };

        let added = delta.added.len();
        let updated = delta.updated.len();
        let removed = delta.removed.len();
        ctx.db.with_tx(|tx| {
            for env in delta.added.iter().chain(delta.updated.iter()) {
                message_repo::upsert_envelope_tx(tx, env)?;
            }
            for id in &delta.removed {
                message_repo::remove_tx(tx, id)?;
            }
            folder_repo::update_sync_state_tx(tx, folder_id, Some(&delta.next_token), now, marker)
        })?;

        log::debug!(
            "Folder '{}' refreshed: {} added, {} updated, {} removed (full listing: {})",
            folder_id,
            added,
            updated,
            removed,
            full_listing
        );
        Ok(())
    }
}

/// Fetches one page of older headers and advances the continuity marker when
/// the page is contiguous with the already-covered range.
pub struct HeaderBackfillExecutor;

#[async_trait]
impl JobExecutor for HeaderBackfillExecutor {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
        let SyncJob::HeaderBackfill {
            account_id,
            folder_id,
        } = job
        else {
            return Err(ExecError::Permanent(format!(
                "backfill executor received {}",
                job.dedupe_key()
            )));
        };

        ctx.check_cancelled()?;
        ctx.credentials.token(account_id)?;
        let state = folder_repo::get(&ctx.db, folder_id)?
            .ok_or_else(|| ExecError::Permanent(format!("unknown folder '{folder_id}'")))?;

        // No marker means no successful full sync yet; the refresh path
        // establishes it first.
        let Some(marker) = state.continuous_history_to else {
            return Ok(());
        };

        let page = ctx
            .provider
            .fetch_header_page(account_id, folder_id, marker)
            .await?;
        ctx.check_cancelled()?;

        // Contiguous means the page's window overlaps or abuts the covered
        // range. A gapped page is still stored, but the marker must not
        // advance past unproven history.
        let contiguous = page.newest >= marker;
        let stored = page.messages.len();
        ctx.db.with_tx(|tx| {
            for env in &page.messages {
                message_repo::upsert_envelope_tx(tx, env)?;
            }
            if contiguous && page.oldest < marker {
                folder_repo::update_history_marker_tx(tx, folder_id, page.oldest)?;
            }
            Ok(())
        })?;

        if contiguous {
            log::debug!(
                "Backfilled {} headers for folder '{}', history now reaches {}",
                stored,
                folder_id,
                page.oldest
            );
        } else {
            log::warn!(
                "Backfill page for folder '{}' is not contiguous (newest {} < marker {}), \
                 stored {} headers without advancing continuity",
                folder_id,
                page.newest,
                marker,
                stored
            );
        }
        Ok(())
    }
}
