//! Error manager.
//!
//! Failed and skipped files go to two spillover streams per repository and
//! phase: `retryable` (picked up by the next Errors-Retry phase) and `skipped`
//! (known limitations, reported only). Both streams are written by their own
//! single writer task.

use super::chunk::{FileOutcome, FileStatus};
use super::phase::PhaseId;
use super::spill::{self, SpillConfig, SpillQueue, SpillWriter};
use crate::error::{Result, TransferError};
use crate::state::{RepoPaths, StateManager};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

const ERRORS_KEY: &str = "errors";

const CSV_HEADER: &str = "repo,path,name,status,status_code,reason,time";

/// `<repo>-<phase>-<epoch millis>-<n>.json`
fn error_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+)-([0-9])-([0-9]{13})-([0-9]+)\.json$").expect("valid error file pattern")
    })
}

/// Which spillover stream an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Skipped,
}

/// Stream for `outcome`, or `None` when it is not an error at all.
pub fn classify(outcome: &FileOutcome) -> Option<ErrorKind> {
    match outcome.status {
        FileStatus::SkippedLargeProps => Some(ErrorKind::Skipped),
        FileStatus::Fail => Some(ErrorKind::Retryable),
        _ => None,
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(flatten)]
    pub outcome: FileOutcome,
    pub time: DateTime<Utc>,
}

/// Producer handle shared by every task of a phase.
#[derive(Clone)]
pub struct ErrorRecorder {
    retryable: SpillQueue<ErrorEntry>,
    skipped: SpillQueue<ErrorEntry>,
    state: Arc<StateManager>,
}

impl ErrorRecorder {
    /// Route an outcome to its stream. Non-error outcomes are ignored.
    pub async fn record(&self, outcome: FileOutcome) -> Result<()> {
        let Some(kind) = classify(&outcome) else {
            return Ok(());
        };
        tracing::debug!(
            "Recording {:?} error for '{}': {}",
            kind,
            outcome.file.full_path(),
            outcome.reason
        );
        let entry = ErrorEntry {
            outcome,
            time: Utc::now(),
        };
        match kind {
            ErrorKind::Retryable => {
                self.retryable.send(entry).await?;
                self.state.change_failures(1, true)
            }
            ErrorKind::Skipped => self.skipped.send(entry).await,
        }
    }

    /// Fails once either writer has failed.
    pub fn check(&self) -> Result<()> {
        self.retryable.check()?;
        self.skipped.check()
    }
}

/// The two writer tasks behind an [`ErrorRecorder`].
pub struct ErrorWriters {
    retryable: (SpillWriter<ErrorEntry>, mpsc::Receiver<ErrorEntry>),
    skipped: (SpillWriter<ErrorEntry>, mpsc::Receiver<ErrorEntry>),
}

impl ErrorWriters {
    /// Drain both streams until all recorders are dropped.
    pub async fn run(self) -> Result<Vec<PathBuf>> {
        let (retryable_writer, retryable_rx) = self.retryable;
        let (skipped_writer, skipped_rx) = self.skipped;
        let (mut retryable, skipped) = tokio::try_join!(
            retryable_writer.run(retryable_rx),
            skipped_writer.run(skipped_rx)
        )?;
        retryable.extend(skipped);
        Ok(retryable)
    }
}

/// Recorder and writers for `repo` during `phase`.
pub fn error_channel(
    paths: &RepoPaths,
    repo: &str,
    phase: PhaseId,
    max_entries: usize,
    state: Arc<StateManager>,
) -> (ErrorRecorder, ErrorWriters) {
    let prefix = format!("{repo}-{}", phase.index());
    let (retryable, retryable_writer, retryable_rx) = spill::spill_channel(SpillConfig {
        dir: paths.retryable_errors_dir(),
        prefix: prefix.clone(),
        key: ERRORS_KEY,
        max_entries,
    });
    let (skipped, skipped_writer, skipped_rx) = spill::spill_channel(SpillConfig {
        dir: paths.skipped_errors_dir(),
        prefix,
        key: ERRORS_KEY,
        max_entries,
    });
    (
        ErrorRecorder {
            retryable,
            skipped,
            state,
        },
        ErrorWriters {
            retryable: (retryable_writer, retryable_rx),
            skipped: (skipped_writer, skipped_rx),
        },
    )
}

// =============================================================================
// Pending files
// =============================================================================

/// Retryable error files left by earlier runs, oldest name first.
pub fn list_pending(paths: &RepoPaths) -> Result<Vec<PathBuf>> {
    spill::list_matching(&paths.retryable_errors_dir(), error_file_pattern())
}

pub fn list_skipped(paths: &RepoPaths) -> Result<Vec<PathBuf>> {
    spill::list_matching(&paths.skipped_errors_dir(), error_file_pattern())
}

pub fn read_error_file(path: &Path) -> Result<Vec<ErrorEntry>> {
    spill::read_spill_file(path, ERRORS_KEY)
}

pub fn rewrite_error_file(path: &Path, left: &[ErrorEntry]) -> Result<()> {
    spill::rewrite_spill_file(path, ERRORS_KEY, left)
}

/// Number of retryable entries waiting for `paths`' repository.
pub fn count_retryable(paths: &RepoPaths) -> Result<usize> {
    let mut count = 0;
    for file in list_pending(paths)? {
        count += read_error_file(&file)?.len();
    }
    Ok(count)
}

/// Delete every error and delay file of a repository.
pub fn remove_repo_files(paths: &RepoPaths) -> Result<()> {
    for dir in [
        paths.retryable_errors_dir(),
        paths.skipped_errors_dir(),
        paths.delays_dir(),
    ] {
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// =============================================================================
// Summary
// =============================================================================

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn status_name(status: FileStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Merge the error files of `repos` into one CSV under `working_dir`.
/// Returns `None` when there is nothing to report.
pub fn create_csv_summary(working_dir: &Path, repos: &[String]) -> Result<Option<PathBuf>> {
    let mut rows = Vec::new();
    for repo in repos {
        let paths = RepoPaths::new(working_dir, repo);
        for file in list_pending(&paths)?.into_iter().chain(list_skipped(&paths)?) {
            for entry in read_error_file(&file)? {
                let outcome = &entry.outcome;
                rows.push(
                    [
                        csv_field(&outcome.file.repo),
                        csv_field(&outcome.file.path),
                        csv_field(&outcome.file.name),
                        status_name(outcome.status),
                        outcome.status_code.to_string(),
                        csv_field(&outcome.reason),
                        entry.time.to_rfc3339(),
                    ]
                    .join(","),
                );
            }
        }
    }
    if rows.is_empty() {
        return Ok(None);
    }

    let path = working_dir.join(format!(
        "transfer-errors-{}.csv",
        Utc::now().format("%Y%m%d%H%M%S")
    ));
    let mut file = fs::File::create(&path).map_err(|source| TransferError::WriteFile {
        path: path.clone(),
        source,
    })?;
    writeln!(file, "{CSV_HEADER}")?;
    for row in rows {
        writeln!(file, "{row}")?;
    }
    Ok(Some(path))
}
