//! Live status of the current run.
//!
//! Reset at the start of every run and saved continuously so that `status`
//! can report on a transfer running in another process.

use super::estimate::TimeEstimation;
use super::transfer_state::ProgressState;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Version of the run status file
pub const TRANSFER_RUN_STATUS_VERSION: u32 = 1;

/// A chunk that has been in flight longer than the stale threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleChunk {
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Submission time, seconds since the epoch
    pub sent: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleChunks {
    pub node_id: String,
    #[serde(rename = "stale_node_chunks", default)]
    pub chunks: Vec<StaleChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferRunStatus {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub current_repo: String,
    #[serde(default)]
    pub build_info_repo: bool,
    #[serde(default)]
    pub current_repo_phase: usize,
    #[serde(default)]
    pub working_threads: usize,
    #[serde(default)]
    pub transfer_failures: u64,
    /// Bytes and files of all repositories in this run
    #[serde(default)]
    pub overall_transfer: ProgressState,
    /// Repositories done out of the repositories in this run (units only)
    #[serde(default)]
    pub total_repositories: ProgressState,
    #[serde(default)]
    pub overall_bi_files: ProgressState,
    #[serde(default)]
    pub time_estimation: TimeEstimation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale_chunks: Vec<StaleChunks>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_nodes: Vec<String>,
}

impl TransferRunStatus {
    pub fn new() -> Self {
        Self {
            version: TRANSFER_RUN_STATUS_VERSION,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path).map_err(|source| TransferError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let status: TransferRunStatus = serde_json::from_str(&text)?;
        if status.version != TRANSFER_RUN_STATUS_VERSION {
            return Err(TransferError::Config(format!(
                "unsupported run status version {} in {}; remove the working directory to start over",
                status.version,
                path.display()
            )));
        }
        Ok(Some(status))
    }

    pub fn stale_chunk_count(&self) -> usize {
        self.stale_chunks.iter().map(|node| node.chunks.len()).sum()
    }
}
