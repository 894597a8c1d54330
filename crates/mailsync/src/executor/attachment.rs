//! Attachment download executor.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::attachment_repo;
use crate::models::AttachmentDownloadState;
use crate::provider::ProviderError;
use crate::sync::job::SyncJob;

use super::{ExecContext, ExecError, JobExecutor};

/// Downloads attachment content to the configured content directory, then
/// records path and state in one transaction. The file write happens before
/// the transaction; an orphaned file from a crash in between is overwritten
/// on the next attempt.
pub struct AttachmentExecutor;

fn safe_filename(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
}

#[async_trait]
impl JobExecutor for AttachmentExecutor {
    async fn execute(&self, job: &SyncJob, ctx: &ExecContext) -> Result<(), ExecError> {
        let SyncJob::DownloadAttachment {
            account_id,
            message_id,
            attachment_id,
            ..
        } = job
        else {
            return Err(ExecError::Permanent(format!(
                "attachment executor received {}",
                job.dedupe_key()
            )));
        };

        ctx.check_cancelled()?;
        if let Some(row) = attachment_repo::get(&ctx.db, message_id, attachment_id)? {
            if row.state == AttachmentDownloadState::Downloaded {
                return Ok(());
            }
        }
        ctx.credentials.token(account_id)?;

        let content = match ctx
            .provider
            .fetch_attachment(account_id, message_id, attachment_id)
            .await
        {
            Ok(content) => content,
            Err(ProviderError::Permanent(msg)) => {
                attachment_repo::mark_failed(&ctx.db, message_id, attachment_id, &msg)?;
                return Err(ExecError::Permanent(msg));
            }
            Err(err) => return Err(err.into()),
        };
        ctx.check_cancelled()?;

        let dir = ctx.config.content_dir.join(message_id).join(attachment_id);
        fs::create_dir_all(&dir)
            .map_err(|e| ExecError::Transient(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(safe_filename(&content.meta.filename));
        fs::write(&path, &content.bytes)
            .map_err(|e| ExecError::Transient(format!("write {}: {e}", path.display())))?;

        let now = Utc::now();
        let local_path = path.to_string_lossy().into_owned();
        ctx.db.with_tx(|tx| {
            attachment_repo::upsert_meta_tx(tx, &content.meta)?;
            attachment_repo::mark_downloaded_tx(
                tx,
                message_id,
                attachment_id,
                &local_path,
                content.bytes.len() as u64,
                now,
            )
        })?;

        log::debug!(
            "Downloaded attachment '{}' of message '{}' ({} bytes) to {}",
            attachment_id,
            message_id,
            content.bytes.len(),
            local_path
        );
        Ok(())
    }
}
