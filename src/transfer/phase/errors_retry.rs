//! Errors-Retry: upload again the files earlier runs recorded as retryable.

use super::{Phase, PhaseContext, PhaseId};
use crate::error::Result;
use crate::transfer::delayed;
use crate::transfer::errors;
use crate::transfer::manager::{self, Submission, TransferHandles};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ErrorsRetryPhase {
    ctx: PhaseContext,
}

impl ErrorsRetryPhase {
    pub fn new(ctx: PhaseContext) -> Self {
        Self { ctx }
    }
}

/// Re-chunk every entry of `files`. A file is deleted once all of its entries
/// were handed on; a stop rewrites it with the entries that were not.
async fn retry_files(
    ctx: Arc<PhaseContext>,
    handles: TransferHandles,
    files: Vec<PathBuf>,
) -> Result<()> {
    let mut builder = ctx.chunk_builder();
    for file in files {
        let entries = errors::read_error_file(&file)?;
        let count = entries.len() as u64;
        tracing::debug!("Retrying {} file(s) from {}", count, file.display());
        let candidates: Vec<_> = entries
            .iter()
            .map(|entry| entry.outcome.file.clone())
            .collect();
        match handles.upload_candidates(&mut builder, candidates).await? {
            Submission::Complete => {
                fs::remove_file(&file)?;
                ctx.state.change_failures(count, false)?;
            }
            Submission::Stopped(unsubmitted) => {
                let left = manager::keep_unsubmitted(entries, &unsubmitted, |entry| {
                    &entry.outcome.file
                });
                let handed_on = count - left.len() as u64;
                errors::rewrite_error_file(&file, &left)?;
                ctx.state.change_failures(handed_on, false)?;
                return Ok(());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Phase for ErrorsRetryPhase {
    fn id(&self) -> PhaseId {
        PhaseId::ErrorsRetry
    }

    async fn should_skip(&self) -> Result<bool> {
        let pending = errors::count_retryable(&self.ctx.paths)?;
        if pending == 0 && delayed::list_delay_files(&self.ctx.paths)?.is_empty() {
            tracing::debug!("No retryable errors for '{}'", self.ctx.repo_key());
            return Ok(true);
        }
        Ok(false)
    }

    async fn started(&self) -> Result<()> {
        tracing::info!("Retrying transfer failures of '{}'", self.ctx.repo_key());
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let ctx = Arc::new(self.ctx.clone());
        let files = errors::list_pending(&ctx.paths)?;
        if !files.is_empty() {
            manager::run_transfer(
                &ctx,
                PhaseId::ErrorsRetry,
                None,
                delayed::predicates_for(&ctx.repo.package_type),
                |handles| retry_files(ctx.clone(), handles, files),
            )
            .await?;
        }
        if ctx.stop.is_stopped() {
            return Ok(());
        }
        manager::consume_delayed_files(&ctx, PhaseId::ErrorsRetry).await
    }

    async fn done(&self) -> Result<()> {
        tracing::info!("Done retrying failures of '{}'", self.ctx.repo_key());
        Ok(())
    }
}
