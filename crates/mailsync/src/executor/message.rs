//! Full message body executor.

use async_trait::async_trait;
use chrono::Utc;

use crate::db::{attachment_repo, message_repo};
use crate::provider::ProviderError;
use crate::sync::job::SyncJob;

use super::{ExecContext, ExecError, JobExecutor};

/// Fetches a message body plus attachment metadata and commits both in one
/// transaction. A body already in the cache makes redelivery a no-op.
pub struct MessageBodyExecutor;

#[async_trait]
impl JobExecutor for MessageBodyExecutor {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
        let SyncJob::FetchFullMessageBody {
            account_id,
            message_id,
            ..
        } = job
        else {
            return Err(ExecError::Permanent(format!(
                "message body executor received {}",
                job.dedupe_key()
            )));
        };

        ctx.check_cancelled()?;
        if message_repo::body_content(&ctx.db, message_id)?.is_some() {
            return Ok(());
        }
        ctx.credentials.token(account_id)?;

        let full = match ctx.provider.fetch_message(account_id, message_id).await {
            Ok(full) => full,
            Err(ProviderError::Permanent(msg)) => {
                message_repo::mark_error(&ctx.db, message_id, &msg)?;
                return Err(ExecError::Permanent(msg));
            }
            Err(err) => return Err(err.into()),
        };
        ctx.check_cancelled()?;

        let now = Utc::now();
        ctx.db.with_tx(|tx| {
            message_repo::upsert_envelope_tx(tx, &full.envelope)?;
            message_repo::store_body_tx(tx, message_id, &full.body, now)?;
            for meta in &full.attachments {
                attachment_repo::upsert_meta_tx(tx, meta)?;
            }
            Ok(())
        })?;

        log::debug!(
            "Cached body for message '{}' ({} bytes, {} attachments)",
            message_id,
            full.body.len(),
            full.attachments.len()
        );
        Ok(())
    }
}
