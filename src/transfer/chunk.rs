//! Chunk and status model.
//!
//! A chunk is the unit of upload: an ordered batch of file candidates that the
//! source plugin transfers and reports on as one. The builder seals a chunk once
//! it holds more than [`MAX_CHUNK_FILES`] candidates or more than
//! [`MAX_CHUNK_BYTES`] of content, carrying the overflowing candidate into the
//! next chunk.

use crate::api::TargetAuth;
use serde::{Deserialize, Serialize};

/// Candidate count a chunk may hold before it is full
pub const MAX_CHUNK_FILES: usize = 16;

/// Cumulative candidate size a chunk may hold before it is full (1 GiB)
pub const MAX_CHUNK_BYTES: u64 = 1024 * 1024 * 1024;

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

// =============================================================================
// FileCandidate
// =============================================================================

/// A file or directory offered for upload.
///
/// Identity is `(repo, path, name)`. A directory candidate has an empty name and
/// uses `path` for the directory itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileCandidate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_empty_dir: bool,
}

impl FileCandidate {
    pub fn file(repo: &str, path: &str, name: &str, size: u64) -> Self {
        Self {
            repo: repo.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            size,
            non_empty_dir: false,
        }
    }

    pub fn directory(repo: &str, path: &str, non_empty: bool) -> Self {
        Self {
            repo: repo.to_string(),
            path: path.to_string(),
            name: String::new(),
            size: 0,
            non_empty_dir: non_empty,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.name.is_empty()
    }

    /// `repo/path/name` with the root path (`.`) and empty segments dropped.
    pub fn full_path(&self) -> String {
        [self.repo.as_str(), self.path.as_str(), self.name.as_str()]
            .iter()
            .filter(|part| !part.is_empty() && **part != ".")
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }
}

// =============================================================================
// UploadChunk
// =============================================================================

/// Body of an `uploadChunk` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadChunk {
    #[serde(flatten)]
    pub auth: TargetAuth,
    #[serde(default, skip_serializing_if = "is_false")]
    pub check_existence_in_filestore: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_file_filtering: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_candidates: Vec<FileCandidate>,
}

impl UploadChunk {
    pub fn len(&self) -> usize {
        self.upload_candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upload_candidates.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.upload_candidates.iter().map(|c| c.size).sum()
    }

    /// True once the chunk exceeds the candidate count or the size limit.
    pub fn is_full(&self) -> bool {
        self.len() > MAX_CHUNK_FILES || self.total_size() > MAX_CHUNK_BYTES
    }
}

/// Accumulates candidates into chunks sharing one auth payload and flag set.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    template: UploadChunk,
    current: UploadChunk,
    skip_empty_dirs: bool,
}

impl ChunkBuilder {
    pub fn new(auth: TargetAuth, check_existence_in_filestore: bool) -> Self {
        let template = UploadChunk {
            auth,
            check_existence_in_filestore,
            skip_file_filtering: false,
            upload_candidates: Vec::new(),
        };
        Self {
            current: template.clone(),
            template,
            skip_empty_dirs: false,
        }
    }

    /// Drop directory candidates (build-info repositories have no use for them).
    pub fn skip_empty_dirs(mut self, skip: bool) -> Self {
        self.skip_empty_dirs = skip;
        self
    }

    pub fn skip_file_filtering(mut self, skip: bool) -> Self {
        self.template.skip_file_filtering = skip;
        self.current.skip_file_filtering = skip;
        self
    }

    /// Append a candidate. Returns a sealed chunk when this append overflowed the
    /// current one; the overflowing candidate then starts the next chunk. A lone
    /// candidate above the size limit is sealed by itself.
    pub fn push(&mut self, candidate: FileCandidate) -> Option<UploadChunk> {
        if self.skip_empty_dirs && candidate.is_directory() {
            tracing::debug!(
                "Skipping unneeded directory '{}' in build-info repository '{}'",
                candidate.path,
                candidate.repo
            );
            return None;
        }

        self.current.upload_candidates.push(candidate);
        if !self.current.is_full() {
            return None;
        }
        if self.current.len() == 1 {
            return Some(self.take());
        }

        let overflow = self.current.upload_candidates.pop()?;
        let sealed = self.take();
        self.current.upload_candidates.push(overflow);
        Some(sealed)
    }

    /// Seal whatever is left. Empty chunks are never returned.
    pub fn flush(&mut self) -> Option<UploadChunk> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Candidates of the unsealed chunk, leaving the builder empty.
    pub fn take_pending(&mut self) -> Vec<FileCandidate> {
        std::mem::take(&mut self.current.upload_candidates)
    }

    fn take(&mut self) -> UploadChunk {
        std::mem::replace(&mut self.current, self.template.clone())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Overall processing status of a polled chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    #[default]
    InProgress,
    Done,
}

/// Per-file outcome reported by the source plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Success,
    Fail,
    SkippedLargeProps,
    SkippedMetadataFile,
    SkippedNonEmptyDir,
}

impl FileStatus {
    /// Outcomes that must be recorded by the error manager.
    pub fn is_error(&self) -> bool {
        matches!(self, FileStatus::Fail | FileStatus::SkippedLargeProps)
    }
}

/// One file's result inside a [`ChunkStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOutcome {
    #[serde(flatten)]
    pub file: FileCandidate,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub checksum_deployed: bool,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "is_zero_code")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

fn is_zero_code(code: &u16) -> bool {
    *code == 0
}

impl FileOutcome {
    pub fn success(file: FileCandidate, checksum_deployed: bool) -> Self {
        Self {
            size_bytes: file.size,
            file,
            checksum_deployed,
            status: FileStatus::Success,
            status_code: 0,
            reason: String::new(),
        }
    }

    pub fn failed(file: FileCandidate, status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            size_bytes: file.size,
            file,
            checksum_deployed: false,
            status: FileStatus::Fail,
            status_code,
            reason: reason.into(),
        }
    }

    /// Bytes that actually crossed the wire for this file.
    pub fn transferred_bytes(&self) -> u64 {
        let counted = matches!(
            self.status,
            FileStatus::Success | FileStatus::SkippedLargeProps
        );
        if counted && !self.checksum_deployed {
            self.size_bytes
        } else {
            0
        }
    }
}

/// Status of one submitted chunk, keyed by its upload token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid_token: String,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileOutcome>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_millis: u64,
}
