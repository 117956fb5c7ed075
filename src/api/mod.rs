//! Control protocol against the data-transfer plugin on the source instance.
//!
//! Wire bodies mirror the plugin's JSON; every field is omitted when empty.
//! [`SourceApi`] is the seam the transfer engine talks through, and
//! [`client::ArtifactoryClient`] is its HTTP implementation.

pub mod client;

use crate::error::Result;
use crate::transfer::chunk::{ChunkStatus, FileCandidate, UploadChunk};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Page size of listing and search queries
pub const PAGINATION_LIMIT: usize = 10_000;

/// Status code recorded for chunks a node no longer knows about
pub const SYNC_ERROR_STATUS_CODE: u16 = 404;

/// Reason recorded for chunks a node no longer knows about
pub const SYNC_ERROR_REASON: &str = "un-synchronized chunk status due to network issue";

/// Oldest plugin version the engine can drive
pub const MIN_PLUGIN_VERSION: &str = "1.7.0";

/// Credentials the source plugin uses to push into the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_artifactory_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_proxy_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunksStatusBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub awaiting_status_chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks_to_delete: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadChunksStatusResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks_status: Vec<ChunkStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_chunks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlePropertiesDiff {
    #[serde(flatten)]
    pub auth: TargetAuth,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_key: String,
    #[serde(default)]
    pub start_milliseconds: i64,
    #[serde(default)]
    pub end_milliseconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesError {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlePropertiesDiffResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default)]
    pub properties_delivered: u64,
    #[serde(default)]
    pub properties_total: u64,
    #[serde(default)]
    pub status: crate::transfer::chunk::ProcessStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PropertiesError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCompatibilityResponse {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Listings
// =============================================================================

/// Kind of a listed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

/// One row of a directory listing or a windowed search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub repo: String,
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub size: u64,
}

impl ListItem {
    /// The row a folder listing returns for the listed folder itself.
    pub fn is_self_entry(&self) -> bool {
        self.name == "." || (self.item_type == ItemType::Folder && self.name.is_empty())
    }

    pub fn to_candidate(&self) -> FileCandidate {
        FileCandidate::file(&self.repo, &self.path, &self.name, self.size)
    }
}

/// Repository package type, as far as transfer ordering is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    Maven,
    Gradle,
    Ivy,
    Docker,
    Conan,
    BuildInfo,
    Other(String),
}

impl PackageType {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "maven" => PackageType::Maven,
            "gradle" => PackageType::Gradle,
            "ivy" => PackageType::Ivy,
            "docker" => PackageType::Docker,
            "conan" => PackageType::Conan,
            "buildinfo" => PackageType::BuildInfo,
            _ => PackageType::Other(raw.to_string()),
        }
    }
}

/// A repository on the source instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
    pub key: String,
    pub package_type: PackageType,
    /// Files stored, as reported by the storage summary
    pub files_count: u64,
    pub size_bytes: u64,
}

impl RepoSummary {
    pub fn new(key: &str, package_type: PackageType) -> Self {
        Self {
            key: key.to_string(),
            package_type,
            files_count: 0,
            size_bytes: 0,
        }
    }

    pub fn with_totals(mut self, files_count: u64, size_bytes: u64) -> Self {
        self.files_count = files_count;
        self.size_bytes = size_bytes;
        self
    }

    pub fn is_build_info(&self) -> bool {
        self.package_type == PackageType::BuildInfo
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Everything the engine asks of the source instance.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Submit a chunk. A response without a token means every file was
    /// resolved synchronously.
    async fn upload_chunk(&self, chunk: &UploadChunk) -> Result<UploadChunkResponse>;

    /// Poll outstanding tokens and acknowledge finished ones.
    async fn sync_chunks(&self, body: &UploadChunksStatusBody)
        -> Result<UploadChunksStatusResponse>;

    async fn store_properties(&self, repo_key: &str) -> Result<()>;

    async fn handle_properties_diff(
        &self,
        request: &HandlePropertiesDiff,
    ) -> Result<HandlePropertiesDiffResponse>;

    /// Stop the transfer on whichever node answers. Returns that node's id.
    async fn stop(&self) -> Result<String>;

    async fn verify_compatibility(&self) -> Result<VerifyCompatibilityResponse>;

    async fn data_transfer_version(&self) -> Result<String>;

    async fn verify_connectivity(&self, auth: &TargetAuth) -> Result<()>;

    /// Ping the instance and return the id of the node that answered.
    async fn ping_node(&self) -> Result<String>;

    /// Local repositories plus build-info repositories.
    async fn repositories(&self) -> Result<Vec<RepoSummary>>;

    /// One page of the direct children of `path`, sorted by name, as the
    /// server returned it. The page may hold a self entry for `path`; it still
    /// counts toward the page size.
    async fn list_directory(&self, repo: &str, path: &str, page: usize) -> Result<Vec<ListItem>>;

    /// One page of files modified in `[from, to)`.
    async fn search_modified(
        &self,
        repo: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<ListItem>>;

    /// One page of `manifest.json` files modified in `[from, to)`.
    async fn search_manifests(
        &self,
        repo: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<ListItem>>;
}

/// What the engine asks of the target instance.
#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn repository_keys(&self) -> Result<Vec<String>>;
}

/// Compare dotted versions numerically. A `-SNAPSHOT` version always passes.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    if version.to_ascii_uppercase().contains("SNAPSHOT") {
        return true;
    }
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (current, min) = (parse(version), parse(minimum));
    let len = current.len().max(min.len());
    for i in 0..len {
        let a = current.get(i).copied().unwrap_or(0);
        let b = min.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}
