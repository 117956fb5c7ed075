// Durable per-repository transfer state
//
// Records when the full transfer of a repository started and ended, and which
// time ranges the Files-Diff phase has handled. Survives across runs and drives
// which phases still need to run.

use crate::error::{Result, TransferError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Version of the repository state file
pub const TRANSFER_STATE_VERSION: u32 = 0;

/// Start and end of one phase run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

/// One Files-Diff run and the range it covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffDetails {
    #[serde(default)]
    pub files_diff: PhaseDetails,
    #[serde(default)]
    pub handled_range: PhaseDetails,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub completed: bool,
}

/// Bytes and units (files or repositories) done out of a total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub transferred_size_bytes: u64,
    #[serde(default)]
    pub total_units: u64,
    #[serde(default)]
    pub transferred_units: u64,
}

impl ProgressState {
    pub fn add_transferred(&mut self, files: u64, bytes: u64) {
        self.transferred_units += files;
        self.transferred_size_bytes += bytes;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub full_transfer: PhaseDetails,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<DiffDetails>,
    #[serde(default)]
    pub progress: ProgressState,
    #[serde(default)]
    pub diff_progress: ProgressState,
}

/// State document of the repository being transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    #[serde(default)]
    pub state_version: u32,
    pub repository: Repository,
}

impl TransferState {
    pub fn new(repo: &str) -> Self {
        Self {
            state_version: TRANSFER_STATE_VERSION,
            repository: Repository {
                name: repo.to_string(),
                ..Default::default()
            },
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
        let state: TransferState = serde_json::from_str(&text)?;
        if state.state_version != TRANSFER_STATE_VERSION {
            return Err(TransferError::Config(format!(
                "unexpected repository state file found: {}",
                path.display()
            )));
        }
        Ok(Some(state))
    }

    pub fn is_repo_transferred(&self) -> bool {
        self.repository.full_transfer.ended.is_some()
    }

    pub fn set_full_transfer_started(&mut self, now: DateTime<Utc>) {
        self.repository.full_transfer.started = Some(now);
    }

    pub fn set_full_transfer_completed(&mut self, now: DateTime<Utc>) {
        self.repository.full_transfer.ended = Some(now);
    }

    /// Open a new diff run. The range starts where the last completed run
    /// ended, or at the full transfer start when none completed, and ends now.
    pub fn add_new_diff(&mut self, now: DateTime<Utc>) -> Result<()> {
        let start = self
            .repository
            .diffs
            .iter()
            .rev()
            .find(|diff| diff.completed)
            .and_then(|diff| diff.handled_range.ended)
            .or(self.repository.full_transfer.started)
            .ok_or_else(|| {
                TransferError::Config(format!(
                    "repository '{}' has no full transfer start time",
                    self.repository.name
                ))
            })?;

        self.repository.diffs.push(DiffDetails {
            files_diff: PhaseDetails {
                started: Some(now),
                ended: None,
            },
            handled_range: PhaseDetails {
                started: Some(start),
                ended: Some(now),
            },
            completed: false,
        });
        Ok(())
    }

    /// Close the current diff run.
    pub fn set_files_diff_completed(&mut self, now: DateTime<Utc>) {
        if let Some(diff) = self.repository.diffs.last_mut() {
            diff.files_diff.ended = Some(now);
            diff.completed = true;
        }
    }

    /// Range of the current diff run.
    pub fn diff_handling_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let range = &self.repository.diffs.last()?.handled_range;
        Some((range.started?, range.ended?))
    }
}
