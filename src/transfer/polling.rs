//! Chunk submission and status polling.
//!
//! Uploaders take a slot from [`Admission`] before sending a chunk; the slot is
//! held until the chunk's final status is known. Accepted tokens go to the
//! single [`ChunkPoller`], which asks the source for their status in batches,
//! acknowledges finished tokens on the next poll, and hands results to the
//! [`ChunkHandler`].

use super::chunk::{ChunkStatus, FileCandidate, FileOutcome, ProcessStatus, UploadChunk};
use super::errors::ErrorRecorder;
use super::pipeline::StopSignal;
use super::snapshot::RepoSnapshot;
use crate::api::{SourceApi, UploadChunksStatusBody, SYNC_ERROR_REASON, SYNC_ERROR_STATUS_CODE};
use crate::error::{Result, TransferError};
use crate::state::{StaleChunk, StaleChunks, StateManager};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Chunks in flight for longer than this are reported as stale
pub const STALE_CHUNK_THRESHOLD_MINUTES: i64 = 30;

/// Reason recorded for files whose chunk was dropped or abandoned by a stop
pub const STOPPED_REASON: &str = "transfer stopped before the chunk status was known";

/// Capacity of the queue between uploaders and the poller
pub const TOKENS_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// Admission
// =============================================================================

/// Counts chunks in flight against the working thread count.
#[derive(Debug)]
pub struct Admission {
    in_flight: Mutex<usize>,
    limit: AtomicUsize,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Self {
            in_flight: Mutex::new(0),
            limit: AtomicUsize::new(limit.max(1)),
        }
    }

    /// Take a slot if one is free.
    pub fn try_admit(&self) -> bool {
        let mut in_flight = self.in_flight.lock();
        if *in_flight < self.limit.load(Ordering::SeqCst) {
            *in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Slots already taken above a lowered limit drain naturally.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit.max(1), Ordering::SeqCst);
    }
}

// =============================================================================
// Results
// =============================================================================

/// Applies final chunk results to progress, errors and the snapshot.
pub struct ChunkHandler {
    state: Arc<StateManager>,
    errors: ErrorRecorder,
    snapshot: Option<Arc<RepoSnapshot>>,
}

impl ChunkHandler {
    pub fn new(
        state: Arc<StateManager>,
        errors: ErrorRecorder,
        snapshot: Option<Arc<RepoSnapshot>>,
    ) -> Self {
        Self {
            state,
            errors,
            snapshot,
        }
    }

    pub async fn handle_done(&self, status: &ChunkStatus, duration_millis: u64) -> Result<()> {
        self.state.update_chunk(status, duration_millis)?;
        for outcome in &status.files {
            if outcome.status.is_error() {
                self.errors.record(outcome.clone()).await?;
            }
        }
        self.update_snapshot(status.files.iter().map(|outcome| &outcome.file))
    }

    /// Record every file of a chunk as failed.
    pub async fn handle_failed(
        &self,
        files: &[FileCandidate],
        status_code: u16,
        reason: &str,
    ) -> Result<()> {
        for file in files {
            self.errors
                .record(FileOutcome::failed(file.clone(), status_code, reason))
                .await?;
        }
        self.update_snapshot(files.iter())
    }

    /// Files of a chunk dropped or abandoned by a stop. Without a snapshot
    /// nothing else remembers them, so they are recorded as retryable.
    pub async fn handle_dropped(&self, files: &[FileCandidate]) -> Result<()> {
        if self.snapshot.is_some() {
            return Ok(());
        }
        for file in files {
            self.errors
                .record(FileOutcome::failed(file.clone(), 0, STOPPED_REASON))
                .await?;
        }
        Ok(())
    }

    fn update_snapshot<'a>(&self, files: impl Iterator<Item = &'a FileCandidate>) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        for file in files.filter(|file| !file.is_directory()) {
            let node = snapshot.lookup_or_create(&file.path)?;
            node.decrement_files()?;
            node.check_completed();
        }
        Ok(())
    }
}

// =============================================================================
// Uploader
// =============================================================================

/// A chunk accepted by the source and waiting for its final status.
#[derive(Debug, Clone)]
pub struct InFlightChunk {
    pub token: String,
    pub node_id: String,
    pub files: Vec<FileCandidate>,
    pub sent: DateTime<Utc>,
    submitted: Instant,
}

impl InFlightChunk {
    fn elapsed_millis(&self) -> u64 {
        self.submitted.elapsed().as_millis() as u64
    }
}

/// Sends chunks once a slot is free.
pub struct ChunkUploader {
    source: Arc<dyn SourceApi>,
    admission: Arc<Admission>,
    handler: Arc<ChunkHandler>,
    tokens: mpsc::Sender<InFlightChunk>,
    stop: StopSignal,
    backoff: Duration,
}

impl ChunkUploader {
    pub fn new(
        source: Arc<dyn SourceApi>,
        admission: Arc<Admission>,
        handler: Arc<ChunkHandler>,
        tokens: mpsc::Sender<InFlightChunk>,
        stop: StopSignal,
        backoff: Duration,
    ) -> Self {
        Self {
            source,
            admission,
            handler,
            tokens,
            stop,
            backoff,
        }
    }

    /// Wait for a slot, then submit. A chunk still waiting when a stop
    /// arrives is not sent.
    pub async fn upload(&self, chunk: UploadChunk) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                return self.handler.handle_dropped(&chunk.upload_candidates).await;
            }
            if self.admission.try_admit() {
                break;
            }
            tokio::time::sleep(self.backoff).await;
        }

        let files = chunk.upload_candidates.clone();
        let sent = Utc::now();
        let submitted = Instant::now();
        let response = match self.source.upload_chunk(&chunk).await {
            Ok(response) if response.node_id.is_empty() => Err(TransferError::Task(
                "upload chunk response is missing the node id".to_string(),
            )),
            other => other,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.admission.release();
                self.handler.handle_failed(&files, 0, &e.to_string()).await?;
                return Err(e);
            }
        };

        if response.uuid_token.is_empty() {
            // Resolved while handling the request; nothing to poll for.
            self.admission.release();
            let status = ChunkStatus {
                status: ProcessStatus::Done,
                files: files
                    .into_iter()
                    .map(|file| FileOutcome::success(file, true))
                    .collect(),
                ..Default::default()
            };
            return self.handler.handle_done(&status, 0).await;
        }

        tracing::debug!(
            "Chunk {} accepted by node {} ({} files)",
            response.uuid_token,
            response.node_id,
            files.len()
        );
        let in_flight = InFlightChunk {
            token: response.uuid_token,
            node_id: response.node_id,
            files,
            sent,
            submitted,
        };
        if let Err(mpsc::error::SendError(chunk)) = self.tokens.send(in_flight).await {
            self.admission.release();
            // The poller stops taking tokens once a stop arrives.
            if self.stop.is_stopped() {
                return self.handler.handle_dropped(&chunk.files).await;
            }
            return Err(TransferError::Task("chunk poller is gone".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Poller
// =============================================================================

/// The single task tracking tokens until they are done.
pub struct ChunkPoller {
    source: Arc<dyn SourceApi>,
    admission: Arc<Admission>,
    handler: Arc<ChunkHandler>,
    state: Arc<StateManager>,
    tokens: mpsc::Receiver<InFlightChunk>,
    stop: StopSignal,
    interval: Duration,
    in_flight: HashMap<String, InFlightChunk>,
    to_delete: HashSet<String>,
    reported_stale: bool,
}

impl ChunkPoller {
    pub fn new(
        source: Arc<dyn SourceApi>,
        admission: Arc<Admission>,
        handler: Arc<ChunkHandler>,
        state: Arc<StateManager>,
        tokens: mpsc::Receiver<InFlightChunk>,
        stop: StopSignal,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            admission,
            handler,
            state,
            tokens,
            stop,
            interval,
            in_flight: HashMap::new(),
            to_delete: HashSet::new(),
            reported_stale: false,
        }
    }

    /// Poll until every uploader is gone and no token is outstanding. A stop
    /// ends polling early. A failed status request is fatal.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                return self.abandon_outstanding().await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.stop.wait() => return self.abandon_outstanding().await,
            }

            let closed = self.fill_batch();
            self.report_stale_chunks()?;
            if self.in_flight.is_empty() {
                if closed {
                    return Ok(());
                }
                continue;
            }
            self.poll_once().await?;
        }
    }

    /// Stop taking tokens and hand every chunk that will not be polled again
    /// to the handler.
    async fn abandon_outstanding(&mut self) -> Result<()> {
        self.tokens.close();
        while let Ok(chunk) = self.tokens.try_recv() {
            self.in_flight.insert(chunk.token.clone(), chunk);
        }
        let abandoned: Vec<InFlightChunk> =
            self.in_flight.drain().map(|(_, chunk)| chunk).collect();
        if !abandoned.is_empty() {
            tracing::debug!("Abandoning {} chunk(s) still in flight", abandoned.len());
        }
        for chunk in abandoned {
            self.admission.release();
            self.handler.handle_dropped(&chunk.files).await?;
        }
        Ok(())
    }

    /// Move newly accepted tokens into the batch, up to the thread count.
    /// Returns true once every sender is gone and the queue is empty.
    fn fill_batch(&mut self) -> bool {
        let limit = self.admission.limit();
        while self.in_flight.len() < limit {
            match self.tokens.try_recv() {
                Ok(chunk) => {
                    self.in_flight.insert(chunk.token.clone(), chunk);
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
        false
    }

    async fn poll_once(&mut self) -> Result<()> {
        let body = UploadChunksStatusBody {
            awaiting_status_chunks: self.in_flight.keys().cloned().collect(),
            chunks_to_delete: self.to_delete.iter().cloned().collect(),
        };
        let response = self.source.sync_chunks(&body).await?;

        for deleted in &response.deleted_chunks {
            self.to_delete.remove(deleted);
        }
        self.fail_missing_chunks(&response.node_id, &response.chunks_status)
            .await?;

        for status in &response.chunks_status {
            if status.status != ProcessStatus::Done {
                continue;
            }
            let Some(chunk) = self.in_flight.remove(&status.uuid_token) else {
                continue;
            };
            self.admission.release();
            self.to_delete.insert(status.uuid_token.clone());
            let duration = if status.duration_millis > 0 {
                status.duration_millis
            } else {
                chunk.elapsed_millis()
            };
            tracing::debug!(
                "Chunk {} done: {} files in {}ms",
                status.uuid_token,
                status.files.len(),
                duration
            );
            self.handler.handle_done(status, duration).await?;
        }
        Ok(())
    }

    /// Tokens sent to the responding node that it no longer reports are lost.
    async fn fail_missing_chunks(&mut self, node_id: &str, reported: &[ChunkStatus]) -> Result<()> {
        if node_id.is_empty() {
            return Ok(());
        }
        let reported: HashSet<&str> = reported.iter().map(|s| s.uuid_token.as_str()).collect();
        let missing: Vec<String> = self
            .in_flight
            .values()
            .filter(|chunk| chunk.node_id == node_id && !reported.contains(chunk.token.as_str()))
            .map(|chunk| chunk.token.clone())
            .collect();
        for token in missing {
            if let Some(chunk) = self.in_flight.remove(&token) {
                tracing::warn!(
                    "Chunk {} is unknown to node {}; recording its files as failed",
                    token,
                    node_id
                );
                self.admission.release();
                self.handler
                    .handle_failed(&chunk.files, SYNC_ERROR_STATUS_CODE, SYNC_ERROR_REASON)
                    .await?;
            }
        }
        Ok(())
    }

    fn report_stale_chunks(&mut self) -> Result<()> {
        let stale = stale_chunks(self.in_flight.values(), Utc::now());
        if stale.is_empty() && !self.reported_stale {
            return Ok(());
        }
        self.reported_stale = !stale.is_empty();
        self.state.set_stale_chunks(stale)
    }
}

/// Group chunks older than [`STALE_CHUNK_THRESHOLD_MINUTES`] by node.
pub fn stale_chunks<'a>(
    chunks: impl Iterator<Item = &'a InFlightChunk>,
    now: DateTime<Utc>,
) -> Vec<StaleChunks> {
    let threshold = chrono::Duration::minutes(STALE_CHUNK_THRESHOLD_MINUTES);
    let mut by_node: BTreeMap<String, Vec<StaleChunk>> = BTreeMap::new();
    for chunk in chunks.filter(|chunk| now - chunk.sent >= threshold) {
        by_node
            .entry(chunk.node_id.clone())
            .or_default()
            .push(StaleChunk {
                chunk_id: chunk.token.clone(),
                files: chunk.files.iter().map(FileCandidate::full_path).collect(),
                sent: chunk.sent.timestamp(),
            });
    }
    by_node
        .into_iter()
        .map(|(node_id, chunks)| StaleChunks { node_id, chunks })
        .collect()
}
