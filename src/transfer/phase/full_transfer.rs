//! Full-Transfer: walk the whole repository and upload every file.
//!
//! Each directory is one builder task. It lists the directory page by page,
//! queues a builder task per subdirectory and chunks the files. Progress is
//! tracked in the repository snapshot so that an interrupted walk resumes
//! from the directories that did not complete.

use super::{Phase, PhaseContext, PhaseId};
use crate::api::{ItemType, PAGINATION_LIMIT};
use crate::error::Result;
use crate::transfer::chunk::FileCandidate;
use crate::transfer::delayed;
use crate::transfer::manager::{self, TransferHandles};
use crate::transfer::snapshot::{RepoSnapshot, ROOT_PATH};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct FullTransferPhase {
    ctx: PhaseContext,
    snapshot: Mutex<Option<Arc<RepoSnapshot>>>,
}

impl FullTransferPhase {
    pub fn new(ctx: PhaseContext) -> Self {
        Self {
            ctx,
            snapshot: Mutex::new(None),
        }
    }
}

/// Relative path of `name` inside `parent`.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn explore_task(
    ctx: Arc<PhaseContext>,
    handles: TransferHandles,
    snapshot: Arc<RepoSnapshot>,
    path: String,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(explore(ctx, handles, snapshot, path))
}

async fn explore(
    ctx: Arc<PhaseContext>,
    handles: TransferHandles,
    snapshot: Arc<RepoSnapshot>,
    path: String,
) -> Result<()> {
    if handles.is_stopped() {
        return Ok(());
    }
    let node = snapshot.lookup_or_create(&path)?;
    if node.is_completed() {
        tracing::debug!("Skipping completed directory '{}'", path);
        return Ok(());
    }
    // Children known from a previous run are reused so their progress is kept.
    let mut previous = node.restart_exploring();
    let repo = ctx.repo_key().to_string();
    let mut builder = ctx.chunk_builder();
    let mut non_empty = false;
    let mut page = 0;

    loop {
        if handles.is_stopped() {
            return Ok(());
        }
        handles.errors.check()?;
        let items = ctx.source.list_directory(&repo, &path, page).await?;
        for item in items.iter().filter(|item| !item.is_self_entry()) {
            non_empty = true;
            match item.item_type {
                ItemType::Folder => {
                    node.add_child(&item.name, &mut previous);
                    handles
                        .submit_builder(explore_task(
                            ctx.clone(),
                            handles.clone(),
                            snapshot.clone(),
                            child_path(&path, &item.name),
                        ))
                        .await?;
                }
                ItemType::File => {
                    let candidate = item.to_candidate();
                    if handles.delays.delay_if_necessary(&candidate).await? {
                        continue;
                    }
                    node.increment_files();
                    if let Some(chunk) = builder.push(candidate) {
                        handles.submit_chunk(chunk).await?;
                    }
                }
            }
        }
        // The self entry is part of the page, so a short page is judged on
        // the raw row count.
        if items.len() < PAGINATION_LIMIT {
            break;
        }
        page += 1;
    }

    if path != ROOT_PATH {
        if let Some(chunk) = builder.push(FileCandidate::directory(&repo, &path, non_empty)) {
            handles.submit_chunk(chunk).await?;
        }
    }
    if let Some(chunk) = builder.flush() {
        handles.submit_chunk(chunk).await?;
    }
    node.mark_done_exploring();
    if node.check_completed() {
        tracing::debug!("Directory '{}' completed", path);
    }
    Ok(())
}

#[async_trait]
impl Phase for FullTransferPhase {
    fn id(&self) -> PhaseId {
        PhaseId::FullTransfer
    }

    async fn should_skip(&self) -> Result<bool> {
        if self.ctx.state.is_repo_transferred() {
            tracing::info!(
                "Full transfer of '{}' already completed, skipping",
                self.ctx.repo_key()
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn started(&self) -> Result<()> {
        let now = Utc::now();
        self.ctx
            .state
            .action(|data| data.repo.set_full_transfer_started(now))?;
        self.ctx.state.save_now()?;
        if self.ctx.config.properties_diff {
            self.ctx.source.store_properties(self.ctx.repo_key()).await?;
        }
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let ctx = Arc::new(self.ctx.clone());
        let snapshot = Arc::new(RepoSnapshot::load_or_new(
            ctx.paths.snapshot_file(),
            ctx.config.lru_capacity,
        )?);
        if snapshot.was_loaded() {
            tracing::info!(
                "Resuming the transfer of '{}' from its saved snapshot",
                ctx.repo_key()
            );
        }
        *self.snapshot.lock() = Some(snapshot.clone());

        let saver = {
            let snapshot = snapshot.clone();
            let every = ctx.timings.snapshot_save_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    if let Err(e) = snapshot.persist() {
                        tracing::warn!("Could not save the repository snapshot: {}", e);
                    }
                }
            })
        };

        let result = manager::run_transfer(
            &ctx,
            PhaseId::FullTransfer,
            Some(snapshot.clone()),
            delayed::predicates_for(&ctx.repo.package_type),
            |handles| {
                let (ctx, snapshot) = (ctx.clone(), snapshot.clone());
                async move {
                    handles
                        .submit_builder(explore_task(
                            ctx,
                            handles.clone(),
                            snapshot,
                            ROOT_PATH.to_string(),
                        ))
                        .await
                }
            },
        )
        .await;
        saver.abort();

        if result.is_err() || ctx.stop.is_stopped() {
            snapshot.persist()?;
        }
        result?;
        if ctx.stop.is_stopped() {
            return Ok(());
        }
        manager::consume_delayed_files_if_no_errors(&ctx, PhaseId::FullTransfer).await
    }

    async fn done(&self) -> Result<()> {
        let now = Utc::now();
        self.ctx
            .state
            .action(|data| data.repo.set_full_transfer_completed(now))?;
        // Completion must be on disk before the snapshot goes away.
        self.ctx.state.save_now()?;
        let snapshot = self.snapshot.lock().take();
        if let Some(snapshot) = snapshot {
            snapshot.remove()?;
        }
        tracing::info!("Full transfer of '{}' completed", self.ctx.repo_key());
        Ok(())
    }
}
