//! Files-Diff: upload what was created or modified since the last handled
//! point in time.
//!
//! The handled range is split into fixed windows, one builder task each.
//! Docker repositories are searched by manifest instead, and the whole
//! directory of every changed manifest is offered again: pushing an existing
//! layer to a new tag does not touch the layer's modification time.

use super::{Phase, PhaseContext, PhaseId};
use crate::api::{HandlePropertiesDiff, ItemType, ListItem, PackageType, PropertiesError, PAGINATION_LIMIT};
use crate::error::{Result, TransferError};
use crate::transfer::chunk::{FileCandidate, FileOutcome, ProcessStatus};
use crate::transfer::delayed;
use crate::transfer::manager::{self, TransferHandles};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// Ranges longer than this are reported; they usually mean no diff run has
/// completed for a long time.
pub const LARGE_RANGE_WARNING_DAYS: i64 = 7;

pub struct FilesDiffPhase {
    ctx: PhaseContext,
}

impl FilesDiffPhase {
    pub fn new(ctx: PhaseContext) -> Self {
        Self { ctx }
    }
}

/// Consecutive `[from, to)` windows covering `[start, end)`.
pub fn split_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    if window <= Duration::zero() {
        return windows;
    }
    let mut from = start;
    while from < end {
        let to = from + window;
        windows.push((from, to));
        from = to;
    }
    windows
}

/// Page through a paginated query until a short page.
async fn collect_pages<F, Fut>(handles: &TransferHandles, mut query: F) -> Result<Option<Vec<ListItem>>>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<ListItem>>>,
{
    let mut all = Vec::new();
    let mut page = 0;
    loop {
        if handles.is_stopped() {
            return Ok(None);
        }
        let items = query(page).await?;
        let last = items.len() < PAGINATION_LIMIT;
        all.extend(items);
        if last {
            return Ok(Some(all));
        }
        page += 1;
    }
}

async fn handle_window(
    ctx: Arc<PhaseContext>,
    handles: TransferHandles,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<()> {
    if handles.is_stopped() {
        return Ok(());
    }
    tracing::debug!("Searching time frame '{}' to '{}'", from, to);
    let repo = ctx.repo_key().to_string();
    let candidates = if ctx.repo.package_type == PackageType::Docker {
        docker_candidates(&ctx, &handles, &repo, from, to).await?
    } else {
        collect_pages(&handles, |page| ctx.source.search_modified(&repo, from, to, page))
            .await?
            .map(|items| items.iter().map(ListItem::to_candidate).collect())
    };
    let Some(candidates) = candidates else {
        return Ok(());
    };
    if candidates.is_empty() {
        tracing::debug!("No diffs found in time frame '{}' to '{}'", from, to);
        return Ok(());
    }

    let bytes = candidates.iter().map(|file| file.size).sum();
    ctx.state.inc_diff_totals(candidates.len() as u64, bytes)?;
    let mut builder = ctx.chunk_builder();
    // A stopped window is not marked completed, so the next run lists it again.
    handles.upload_candidates(&mut builder, candidates).await?;
    Ok(())
}

/// Every file in the directories of the manifests changed in the window.
async fn docker_candidates(
    ctx: &PhaseContext,
    handles: &TransferHandles,
    repo: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Option<Vec<FileCandidate>>> {
    let Some(manifests) =
        collect_pages(handles, |page| ctx.source.search_manifests(repo, from, to, page)).await?
    else {
        return Ok(None);
    };
    let directories: HashSet<&str> = manifests.iter().map(|item| item.path.as_str()).collect();
    let mut candidates = Vec::new();
    for directory in directories {
        let Some(items) =
            collect_pages(handles, |page| ctx.source.list_directory(repo, directory, page)).await?
        else {
            return Ok(None);
        };
        candidates.extend(
            items
                .iter()
                .filter(|item| item.item_type == ItemType::File)
                .map(ListItem::to_candidate),
        );
    }
    Ok(Some(candidates))
}

/// Turn a property replication error into a retryable file failure.
fn property_failure(repo: &str, error: &PropertiesError) -> FileOutcome {
    let (path, name) = match error.file.rsplit_once('/') {
        Some((path, name)) if !path.is_empty() => (path, name),
        _ => (".", error.file.trim_start_matches('/')),
    };
    FileOutcome::failed(
        FileCandidate::file(repo, path, name, 0),
        error.status_code,
        error.reason.clone(),
    )
}

/// Ask every source node to replay property changes of the range, polling
/// until each one reports done.
async fn replicate_properties(
    ctx: Arc<PhaseContext>,
    handles: TransferHandles,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<()> {
    let nodes: HashSet<String> = ctx
        .state
        .read(|data| data.run.source_nodes.iter().cloned().collect());
    let request = HandlePropertiesDiff {
        auth: ctx.config.target_auth(),
        repo_key: ctx.repo_key().to_string(),
        start_milliseconds: from.timestamp_millis(),
        end_milliseconds: to.timestamp_millis(),
    };
    let mut done_nodes = HashSet::new();
    loop {
        if handles.is_stopped() {
            return Ok(());
        }
        let response = ctx.source.handle_properties_diff(&request).await?;
        if response.status == ProcessStatus::Done && done_nodes.insert(response.node_id.clone()) {
            tracing::info!(
                "Node {} delivered {}/{} properties of '{}'",
                response.node_id,
                response.properties_delivered,
                response.properties_total,
                ctx.repo_key()
            );
            for error in &response.errors {
                handles
                    .errors
                    .record(property_failure(ctx.repo_key(), error))
                    .await?;
            }
        }
        let finished = if nodes.is_empty() {
            !done_nodes.is_empty()
        } else {
            nodes.iter().all(|node| done_nodes.contains(node))
        };
        if finished {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(ctx.timings.properties_poll) => {}
            _ = handles.stop.wait() => return Ok(()),
        }
    }
}

#[async_trait]
impl Phase for FilesDiffPhase {
    fn id(&self) -> PhaseId {
        PhaseId::FilesDiff
    }

    async fn should_skip(&self) -> Result<bool> {
        Ok(false)
    }

    async fn started(&self) -> Result<()> {
        let now = Utc::now();
        let mut added = Ok(());
        self.ctx
            .state
            .action(|data| added = data.repo.add_new_diff(now))?;
        added?;
        self.ctx.state.save_now()
    }

    async fn run(&self) -> Result<()> {
        let ctx = Arc::new(self.ctx.clone());
        let (start, end) = ctx
            .state
            .read(|data| data.repo.diff_handling_range())
            .ok_or_else(|| TransferError::Task("files diff has no handling range".to_string()))?;
        if end - start > Duration::days(LARGE_RANGE_WARNING_DAYS) {
            tracing::warn!(
                "Files diff range of '{}' starts at {}; no diff run completed since then",
                ctx.repo_key(),
                start
            );
        }
        let windows = split_range(start, end, ctx.timings.diff_window);
        tracing::info!(
            "Searching {} time frame(s) of '{}' for new and modified files",
            windows.len(),
            ctx.repo_key()
        );

        manager::run_transfer(
            &ctx,
            PhaseId::FilesDiff,
            None,
            delayed::predicates_for(&ctx.repo.package_type),
            |handles| {
                let ctx = ctx.clone();
                async move {
                    for (from, to) in windows {
                        if handles.is_stopped() {
                            break;
                        }
                        handles
                            .submit_builder(handle_window(ctx.clone(), handles.clone(), from, to))
                            .await?;
                    }
                    if ctx.config.properties_diff {
                        handles
                            .submit_builder(replicate_properties(
                                ctx.clone(),
                                handles.clone(),
                                start,
                                end,
                            ))
                            .await?;
                    }
                    Ok(())
                }
            },
        )
        .await?;

        if ctx.stop.is_stopped() {
            return Ok(());
        }
        manager::consume_delayed_files_if_no_errors(&ctx, PhaseId::FilesDiff).await
    }

    async fn done(&self) -> Result<()> {
        let now = Utc::now();
        self.ctx
            .state
            .action(|data| data.repo.set_files_diff_completed(now))?;
        self.ctx.state.save_now()?;
        tracing::info!("Files diff of '{}' completed", self.ctx.repo_key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minutes)
    }

    #[test]
    fn test_split_range_covers_whole_range() {
        let windows = split_range(at(0), at(40), Duration::minutes(15));
        assert_eq!(
            windows,
            vec![(at(0), at(15)), (at(15), at(30)), (at(30), at(45))]
        );
        assert!(split_range(at(10), at(10), Duration::minutes(15)).is_empty());
    }

    #[test]
    fn test_property_failure_splits_path() {
        let error = PropertiesError {
            file: "org/acme/a.jar".to_string(),
            status_code: 500,
            reason: "boom".to_string(),
        };
        let outcome = property_failure("libs", &error);
        assert_eq!(outcome.file.path, "org/acme");
        assert_eq!(outcome.file.name, "a.jar");
        assert_eq!(outcome.status_code, 500);

        let error = PropertiesError {
            file: "a.jar".to_string(),
            ..error
        };
        assert_eq!(property_failure("libs", &error).file.path, ".");
    }
}
