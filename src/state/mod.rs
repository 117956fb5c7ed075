//! Checkpointed transfer state.
//!
//! Two documents live under the working directory: the per-repository
//! [`TransferState`], which survives across runs, and the
//! [`TransferRunStatus`], which is rebuilt every run. Both are owned by the
//! [`StateManager`].

pub mod estimate;
pub mod manager;
pub mod run_status;
pub mod transfer_state;

pub use manager::{StateData, StateManager};
pub use run_status::{StaleChunk, StaleChunks, TransferRunStatus};
pub use transfer_state::{ProgressState, TransferState};

use std::path::{Path, PathBuf};

pub const RUN_STATUS_FILE: &str = "run-status.json";
pub const LOCK_FILE: &str = "transfer.lock";
pub const STOP_FILE: &str = "stop";
pub const REPOSITORIES_DIR: &str = "repositories";

/// Files and directories belonging to one repository.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    root: PathBuf,
}

impl RepoPaths {
    /// Repository directories are named by a hash of the key, so any key is
    /// a valid directory name.
    pub fn new(working_dir: &Path, repo: &str) -> Self {
        let hash = blake3::hash(repo.as_bytes());
        Self {
            root: working_dir
                .join(REPOSITORIES_DIR)
                .join(hash.to_hex().as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("repo-state.json")
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.root.join("snapshot.json")
    }

    pub fn retryable_errors_dir(&self) -> PathBuf {
        self.root.join("errors").join("retryable")
    }

    pub fn skipped_errors_dir(&self) -> PathBuf {
        self.root.join("errors").join("skipped")
    }

    pub fn delays_dir(&self) -> PathBuf {
        self.root.join("delays")
    }
}
