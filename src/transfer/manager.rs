//! One pass of a phase: pools, uploader, poller and spillover writers.
//!
//! A pass is started with a producer that seeds the builder pool (or submits
//! chunks directly). Once the pools go idle, everything is torn down in order:
//! builders, uploaders, the poller (which drains outstanding tokens), then the
//! error and delay writers. The first error of any of them is the pass result.

use super::chunk::{ChunkBuilder, FileCandidate, UploadChunk};
use super::delayed::{self, DelayHelper, DelayPredicate};
use super::errors::{self, ErrorRecorder};
use super::phase::{PhaseContext, PhaseId};
use super::pipeline::{IdleDetector, StopSignal, WorkerPool, IDLE_CHECK_INTERVAL};
use super::polling::{Admission, ChunkHandler, ChunkPoller, ChunkUploader, TOKENS_CHANNEL_SIZE};
use super::snapshot::RepoSnapshot;
use crate::config::{pool_sizes, PoolSizes, ThreadSettings};
use crate::error::{Result, TransferError};
use crate::state::StateManager;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What producers and builder tasks use to feed a pass.
#[derive(Clone)]
pub struct TransferHandles {
    builders: WorkerPool,
    uploaders: WorkerPool,
    uploader: Arc<ChunkUploader>,
    pub delays: DelayHelper,
    pub errors: ErrorRecorder,
    pub stop: StopSignal,
}

impl TransferHandles {
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub async fn submit_builder<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.builders.submit(task).await
    }

    pub async fn submit_chunk(&self, chunk: UploadChunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let uploader = self.uploader.clone();
        self.uploaders
            .submit(async move { uploader.upload(chunk).await })
            .await
    }

    /// Chunk `candidates` and submit them, delaying what must go later.
    /// A stop hands back the candidates that were never passed on; the
    /// builder must be empty on entry.
    pub async fn upload_candidates(
        &self,
        builder: &mut ChunkBuilder,
        candidates: impl IntoIterator<Item = FileCandidate>,
    ) -> Result<Submission> {
        let mut candidates = candidates.into_iter();
        while let Some(candidate) = candidates.next() {
            if self.is_stopped() {
                let mut unsubmitted = builder.take_pending();
                unsubmitted.push(candidate);
                unsubmitted.extend(candidates);
                return Ok(Submission::Stopped(unsubmitted));
            }
            self.errors.check()?;
            if self.delays.delay_if_necessary(&candidate).await? {
                continue;
            }
            if let Some(chunk) = builder.push(candidate) {
                self.submit_chunk(chunk).await?;
            }
        }
        if let Some(chunk) = builder.flush() {
            self.submit_chunk(chunk).await?;
        }
        if self.is_stopped() {
            return Ok(Submission::Stopped(Vec::new()));
        }
        Ok(Submission::Complete)
    }
}

/// How far [`TransferHandles::upload_candidates`] got.
#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
    /// Every candidate was chunked, delayed or submitted.
    Complete,
    /// A stop arrived; these candidates were never passed on.
    Stopped(Vec<FileCandidate>),
}

/// Entries of a spill file whose candidate is among `unsubmitted`, each
/// candidate matching at most once.
pub fn keep_unsubmitted<T>(
    entries: Vec<T>,
    unsubmitted: &[FileCandidate],
    candidate: impl Fn(&T) -> &FileCandidate,
) -> Vec<T> {
    let mut wanted: HashMap<&FileCandidate, usize> = HashMap::new();
    for file in unsubmitted {
        *wanted.entry(file).or_default() += 1;
    }
    entries
        .into_iter()
        .filter(|entry| match wanted.get_mut(candidate(entry)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        })
        .collect()
}

/// Keep only the first error.
fn merge(result: &mut Result<()>, other: Result<()>) {
    if let Err(e) = other {
        if result.is_ok() {
            *result = Err(e);
        } else {
            tracing::debug!("Additional transfer error: {}", e);
        }
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(TransferError::from)?
}

/// Apply `settings.json` to the running pools every `every`.
async fn refresh_threads(
    state: Arc<StateManager>,
    build_info_repo: bool,
    every: Duration,
    mut current: PoolSizes,
    builders: WorkerPool,
    uploaders: WorkerPool,
    admission: Arc<Admission>,
) {
    loop {
        tokio::time::sleep(every).await;
        let settings = match ThreadSettings::load(state.working_dir()) {
            Ok(Some(settings)) => settings,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Could not read the thread settings: {}", e);
                continue;
            }
        };
        let sizes = pool_sizes(settings.threads_number, build_info_repo);
        if sizes == current {
            continue;
        }
        tracing::info!("Number of threads changed to {}", sizes.uploaders);
        builders.set_limit(sizes.builders);
        uploaders.set_limit(sizes.uploaders);
        admission.set_limit(sizes.uploaders);
        if let Err(e) = state.set_working_threads(sizes.uploaders) {
            tracing::warn!("Could not save the working threads: {}", e);
        }
        current = sizes;
    }
}

/// Run one pass of `phase` for the repository in `ctx`.
pub async fn run_transfer<F, Fut>(
    ctx: &PhaseContext,
    phase: PhaseId,
    snapshot: Option<Arc<RepoSnapshot>>,
    predicates: Vec<DelayPredicate>,
    producer: F,
) -> Result<()>
where
    F: FnOnce(TransferHandles) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let sizes = pool_sizes(ctx.threads, ctx.repo.is_build_info());
    ctx.state.set_working_threads(sizes.uploaders)?;
    let max_entries = ctx.config.max_entries_per_spill_file;

    let (error_recorder, error_writers) = errors::error_channel(
        &ctx.paths,
        ctx.repo_key(),
        phase,
        max_entries,
        ctx.state.clone(),
    );
    let error_task = tokio::spawn(error_writers.run());
    let (delays, delay_writer) =
        delayed::delay_channel(&ctx.paths, ctx.repo_key(), predicates, max_entries);
    let delay_task = delay_writer.map(|writer| tokio::spawn(writer.run()));

    // Local cancellation: follows the run's stop, and is also raised when the
    // pass fails so that the pools wind down.
    let stop = StopSignal::new();
    let forward_stop = {
        let (outer, inner) = (ctx.stop.clone(), stop.clone());
        tokio::spawn(async move {
            outer.wait().await;
            inner.trigger();
        })
    };

    let admission = Arc::new(Admission::new(sizes.uploaders));
    let handler = Arc::new(ChunkHandler::new(
        ctx.state.clone(),
        error_recorder.clone(),
        snapshot,
    ));
    let (tokens_tx, tokens_rx) = mpsc::channel(TOKENS_CHANNEL_SIZE);
    let uploader = Arc::new(ChunkUploader::new(
        ctx.source.clone(),
        admission.clone(),
        handler.clone(),
        tokens_tx,
        stop.clone(),
        ctx.timings.poll_interval,
    ));
    let poller = ChunkPoller::new(
        ctx.source.clone(),
        admission.clone(),
        handler,
        ctx.state.clone(),
        tokens_rx,
        stop.clone(),
        ctx.timings.poll_interval,
    );
    let poller_task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let result = poller.run().await;
            if result.is_err() {
                stop.trigger();
            }
            result
        })
    };

    let builders = WorkerPool::new("chunk builder", sizes.builders, ctx.clock.clone());
    let uploaders = WorkerPool::new("chunk uploader", sizes.uploaders, ctx.clock.clone());
    let refresher = tokio::spawn(refresh_threads(
        ctx.state.clone(),
        ctx.repo.is_build_info(),
        ctx.timings.settings_refresh,
        sizes,
        builders.clone(),
        uploaders.clone(),
        admission,
    ));

    let handles = TransferHandles {
        builders: builders.clone(),
        uploaders: uploaders.clone(),
        uploader,
        delays,
        errors: error_recorder,
        stop: stop.clone(),
    };

    let mut result = producer(handles).await;
    if result.is_ok() {
        let detector = IdleDetector::new(
            vec![builders.clone(), uploaders.clone()],
            ctx.clock.clone(),
            ctx.timings.idle_grace,
        );
        result = tokio::select! {
            idle = detector.wait(IDLE_CHECK_INTERVAL) => idle,
            _ = stop.wait() => Ok(()),
        };
    }
    if result.is_err() {
        stop.trigger();
    }
    refresher.abort();

    builders.close().await?;
    uploaders.close().await?;
    if let Some(e) = builders.take_error() {
        merge(&mut result, Err(e));
    }
    if let Some(e) = uploaders.take_error() {
        merge(&mut result, Err(e));
    }
    // Every uploader is gone now, so the token queue is closed and the poller
    // returns once the outstanding tokens are resolved.
    merge(&mut result, join(poller_task).await);
    forward_stop.abort();

    merge(&mut result, join(error_task).await.map(|_| ()));
    if let Some(task) = delay_task {
        merge(&mut result, join(task).await.map(|_| ()));
    }
    result
}

/// Offer the repository's delayed files again, with one predicate fewer each
/// round, until none are left. Files from earlier rounds are deleted once all
/// their entries are submitted.
pub async fn consume_delayed_files(ctx: &PhaseContext, phase: PhaseId) -> Result<()> {
    let mut predicates = delayed::predicates_for(&ctx.repo.package_type);
    loop {
        if ctx.stop.is_stopped() {
            return Ok(());
        }
        let files = delayed::list_delay_files(&ctx.paths)?;
        if files.is_empty() {
            return Ok(());
        }
        let remaining: Vec<DelayPredicate> = predicates.iter().skip(1).copied().collect();
        tracing::info!(
            "Uploading {} delayed artifacts file(s) of '{}'",
            files.len(),
            ctx.repo_key()
        );
        run_transfer(ctx, phase, None, remaining.clone(), |handles| {
            upload_delay_files(ctx.chunk_builder(), handles, files)
        })
        .await?;
        predicates = remaining;
    }
}

async fn upload_delay_files(
    mut builder: ChunkBuilder,
    handles: TransferHandles,
    files: Vec<PathBuf>,
) -> Result<()> {
    for file in files {
        let candidates = delayed::read_delay_file(&file)?;
        match handles.upload_candidates(&mut builder, candidates.clone()).await? {
            Submission::Complete => fs::remove_file(&file)?,
            Submission::Stopped(unsubmitted) => {
                let left = keep_unsubmitted(candidates, &unsubmitted, |candidate| candidate);
                delayed::rewrite_delay_file(&file, &left)?;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Consume delayed files unless retryable errors are pending for the
/// repository, in which case Errors-Retry takes them over.
pub async fn consume_delayed_files_if_no_errors(ctx: &PhaseContext, phase: PhaseId) -> Result<()> {
    let pending = errors::count_retryable(&ctx.paths)?;
    if pending > 0 {
        tracing::info!(
            "{} retryable errors are pending for '{}'; delayed artifacts wait for the retry phase",
            pending,
            ctx.repo_key()
        );
        return Ok(());
    }
    consume_delayed_files(ctx, phase).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::chunk::FileOutcome;
    use crate::transfer::errors::ErrorEntry;
    use chrono::Utc;

    #[test]
    fn test_keep_unsubmitted_matches_each_candidate_once() {
        let a = FileCandidate::file("libs", "org", "a.jar", 1);
        let b = FileCandidate::file("libs", "org", "b.jar", 2);
        let entry = |file: &FileCandidate| ErrorEntry {
            outcome: FileOutcome::failed(file.clone(), 500, "boom"),
            time: Utc::now(),
        };
        // The same file failed twice in earlier runs.
        let entries = vec![entry(&a), entry(&b), entry(&a)];

        let left = keep_unsubmitted(entries.clone(), &[a.clone()], |e| &e.outcome.file);
        assert_eq!(left, vec![entries[0].clone()]);

        let left = keep_unsubmitted(entries.clone(), &[b.clone(), a.clone(), a.clone()], |e| {
            &e.outcome.file
        });
        assert_eq!(left, entries);

        assert!(keep_unsubmitted(entries, &[], |e| &e.outcome.file).is_empty());
    }
}
