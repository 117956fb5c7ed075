//! The three per-repository phases.
//!
//! Each repository goes through Full-Transfer, Files-Diff and Errors-Retry in
//! that order. A phase is driven as `should_skip` → `started` → `run` →
//! `done`, with `done` only called when `run` finished without a stop.

pub mod errors_retry;
pub mod files_diff;
pub mod full_transfer;

use super::chunk::ChunkBuilder;
use super::pipeline::{Clock, StopSignal};
use crate::api::{RepoSummary, SourceApi};
use crate::config::{Timings, TransferConfig};
use crate::error::Result;
use crate::state::{RepoPaths, StateManager};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub use errors_retry::ErrorsRetryPhase;
pub use files_diff::FilesDiffPhase;
pub use full_transfer::FullTransferPhase;

/// Phase identifier, persisted by its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    FullTransfer,
    FilesDiff,
    ErrorsRetry,
}

impl PhaseId {
    pub const ALL: [PhaseId; 3] = [
        PhaseId::FullTransfer,
        PhaseId::FilesDiff,
        PhaseId::ErrorsRetry,
    ];

    pub fn index(self) -> usize {
        match self {
            PhaseId::FullTransfer => 0,
            PhaseId::FilesDiff => 1,
            PhaseId::ErrorsRetry => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            PhaseId::FullTransfer => "Transferring all files in the repository",
            PhaseId::FilesDiff => "Transferring newly created and modified files",
            PhaseId::ErrorsRetry => "Retrying transfer failures",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a phase needs for one repository.
#[derive(Clone)]
pub struct PhaseContext {
    pub repo: RepoSummary,
    pub paths: RepoPaths,
    pub source: Arc<dyn SourceApi>,
    pub state: Arc<StateManager>,
    pub config: Arc<TransferConfig>,
    pub timings: Timings,
    pub stop: StopSignal,
    pub clock: Arc<dyn Clock>,
    /// Thread count when the phase starts; the refresher adjusts it later
    pub threads: usize,
}

impl PhaseContext {
    pub fn repo_key(&self) -> &str {
        &self.repo.key
    }

    /// Builder for chunks of this repository. Build-info repositories never
    /// carry directory entries.
    pub fn chunk_builder(&self) -> ChunkBuilder {
        ChunkBuilder::new(
            self.config.target_auth(),
            self.config.check_existence_in_filestore,
        )
        .skip_empty_dirs(self.repo.is_build_info())
    }
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn id(&self) -> PhaseId;

    async fn should_skip(&self) -> Result<bool>;

    async fn started(&self) -> Result<()>;

    async fn run(&self) -> Result<()>;

    async fn done(&self) -> Result<()>;
}

/// Build the phase `id` for the repository in `ctx`.
pub fn create_phase(id: PhaseId, ctx: PhaseContext) -> Box<dyn Phase> {
    match id {
        PhaseId::FullTransfer => Box::new(FullTransferPhase::new(ctx)),
        PhaseId::FilesDiff => Box::new(FilesDiffPhase::new(ctx)),
        PhaseId::ErrorsRetry => Box::new(ErrorsRetryPhase::new(ctx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_indices() {
        for (i, phase) in PhaseId::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
            assert_eq!(PhaseId::from_index(i), Some(*phase));
        }
        assert_eq!(PhaseId::from_index(3), None);
    }
}
