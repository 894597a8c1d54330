//! Outbox drain executor.
//!
//! Applies an account's pending actions remotely, strictly in insertion
//! order. The drain stops at the first failed action so that later actions
//! never overtake an earlier one they may depend on.

use async_trait::async_trait;
use chrono::Utc;

use crate::db::{message_repo, outbox_repo};
use crate::models::ActionStatus;
use crate::provider::ProviderError;
use crate::sync::job::SyncJob;

use super::{ExecContext, ExecError, JobExecutor};

pub struct OutboxExecutor;

#[async_trait]
impl JobExecutor for OutboxExecutor {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
        let SyncJob::DrainOutbox { account_id } = job else {
            return Err(ExecError::Permanent(format!(
                "outbox executor received {}",
                job.dedupe_key()
            )));
        };

        ctx.check_cancelled()?;
        ctx.credentials.token(account_id)?;
        let actions = outbox_repo::list_due(&ctx.db, account_id)?;
        if actions.is_empty() {
            return Ok(());
        }

        let mut applied = 0usize;
        for action in actions {
            ctx.check_cancelled()?;
            match ctx.provider.apply_action(account_id, &action).await {
                Ok(()) => {
                    ctx.db.with_tx(|tx| {
                        outbox_repo::delete_tx(tx, action.id)?;
                        message_repo::settle_pending_upload_tx(tx, &action.entity_id)
                    })?;
                    applied += 1;
                }
                Err(ProviderError::AuthRequired) => {
                    // Credentials are gone; no later action can succeed and
                    // none of them consumed an attempt.
                    return Err(ExecError::AuthRequired(account_id.clone()));
                }
                Err(err) => {
                    let message = err.to_string();
                    let status =
                        outbox_repo::record_failure(&ctx.db, &action, &message, Utc::now())?;
                    if status == ActionStatus::Failed {
                        log::warn!(
                            "Outbox action {} ({}) for account '{}' dead-lettered after {} attempts: {}",
                            action.id,
                            action.action_type.as_str(),
                            account_id,
                            action.max_attempts,
                            message
                        );
                        message_repo::mark_error(&ctx.db, &action.entity_id, &message)?;
                    }
                    if err.is_retryable() {
                        return Err(err.into());
                    }
                    // The failure is recorded on the row itself; the next
                    // drain retries it in order without flagging the whole
                    // account.
                    log::warn!(
                        "Outbox drain for account '{}' stopped at action {}: {}",
                        account_id,
                        action.id,
                        message
                    );
                    break;
                }
            }
        }

        if applied > 0 {
            log::debug!("Applied {} outbox actions for account '{}'", applied, account_id);
        }
        Ok(())
    }
}
