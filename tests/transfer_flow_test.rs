use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use repo_transfer::api::{
    HandlePropertiesDiff, HandlePropertiesDiffResponse, ItemType, ListItem, PackageType,
    RepoSummary, TargetAuth, UploadChunkResponse, UploadChunksStatusBody,
    UploadChunksStatusResponse, VerifyCompatibilityResponse, PAGINATION_LIMIT,
    SYNC_ERROR_REASON, SYNC_ERROR_STATUS_CODE,
};
use repo_transfer::state::transfer_state::TransferState;
use repo_transfer::state::{
    ProgressState, RepoPaths, StateManager, TransferRunStatus, RUN_STATUS_FILE,
};
use repo_transfer::transfer::chunk::{
    ChunkStatus, FileCandidate, FileOutcome, ProcessStatus, UploadChunk,
};
use repo_transfer::transfer::errors::ErrorEntry;
use repo_transfer::transfer::phase::{FilesDiffPhase, FullTransferPhase, Phase, PhaseContext};
use repo_transfer::transfer::{delayed, errors, SystemClock};
use repo_transfer::{
    Result, SourceApi, StopSignal, TargetApi, Timings, TransferConfig, TransferCoordinator, TransferError,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const NODE: &str = "node-1";

/// In-memory source plugin. Chunks are accepted asynchronously and reported
/// done on the next status poll.
#[derive(Default)]
struct FakeSource {
    repos: Vec<RepoSummary>,
    listings: HashMap<(String, String), Vec<ListItem>>,
    modified: Mutex<Vec<ListItem>>,
    fail_once: Mutex<HashSet<String>>,
    version: String,
    uploaded: Mutex<Vec<FileCandidate>>,
    pending: Mutex<HashMap<String, Vec<FileCandidate>>>,
    tokens: AtomicUsize,
    stops: AtomicUsize,
    stop_on_upload: Mutex<Option<(usize, StopSignal)>>,
    manifests: Mutex<Vec<ListItem>>,
    /// Tokens reported done, and the tokens the poller asked to delete
    done_tokens: Mutex<HashSet<String>>,
    delete_requests: Mutex<Vec<String>>,
    /// Chunks holding a file of this name vanish from the node
    lose: Option<String>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            version: "1.7.2".to_string(),
            ..Default::default()
        }
    }

    fn repo(mut self, key: &str, package_type: PackageType, files: &[(&str, u64)]) -> Self {
        let total: u64 = files.iter().map(|(_, size)| size).sum();
        self.repos
            .push(RepoSummary::new(key, package_type).with_totals(files.len() as u64, total));
        for (full, size) in files {
            let mut parent = ".".to_string();
            let parts: Vec<&str> = full.split('/').collect();
            for (i, part) in parts.iter().enumerate() {
                let is_file = i == parts.len() - 1;
                let item = ListItem {
                    repo: key.to_string(),
                    path: parent.clone(),
                    name: part.to_string(),
                    item_type: if is_file { ItemType::File } else { ItemType::Folder },
                    size: if is_file { *size } else { 0 },
                };
                let listing = self
                    .listings
                    .entry((key.to_string(), parent.clone()))
                    .or_default();
                if !listing.contains(&item) {
                    listing.push(item);
                }
                parent = if parent == "." {
                    part.to_string()
                } else {
                    format!("{parent}/{part}")
                };
            }
        }
        self
    }

    /// A repository whose root holds `names` directly, optionally preceded by
    /// the root's own row as the server returns it.
    fn flat_repo(mut self, key: &str, names: &[String], with_self_entry: bool) -> Self {
        self.repos.push(
            RepoSummary::new(key, PackageType::Other("generic".into()))
                .with_totals(names.len() as u64, names.len() as u64),
        );
        let mut listing = Vec::with_capacity(names.len() + 1);
        if with_self_entry {
            listing.push(ListItem {
                repo: key.to_string(),
                path: ".".to_string(),
                name: ".".to_string(),
                item_type: ItemType::Folder,
                size: 0,
            });
        }
        listing.extend(names.iter().map(|name| ListItem {
            repo: key.to_string(),
            path: ".".to_string(),
            name: name.clone(),
            item_type: ItemType::File,
            size: 1,
        }));
        self.listings.insert((key.to_string(), ".".to_string()), listing);
        self
    }

    fn lose(mut self, name: &str) -> Self {
        self.lose = Some(name.to_string());
        self
    }

    fn set_manifest(&self, repo: &str, path: &str) {
        self.manifests.lock().push(ListItem {
            repo: repo.to_string(),
            path: path.to_string(),
            name: "manifest.json".to_string(),
            item_type: ItemType::File,
            size: 1,
        });
    }

    fn fail_once(self, name: &str) -> Self {
        self.fail_once.lock().insert(name.to_string());
        self
    }

    fn set_modified(&self, repo: &str, path: &str, name: &str, size: u64) {
        self.modified.lock().push(ListItem {
            repo: repo.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            item_type: ItemType::File,
            size,
        });
    }

    /// Full paths of uploaded files, in upload order, directories left out.
    fn uploaded_files(&self) -> Vec<String> {
        self.uploaded
            .lock()
            .iter()
            .filter(|file| !file.is_directory())
            .map(FileCandidate::full_path)
            .collect()
    }

    fn outcome(&self, file: FileCandidate) -> FileOutcome {
        if !file.is_directory() && self.fail_once.lock().remove(&file.name) {
            return FileOutcome::failed(file, 500, "Internal Server Error");
        }
        FileOutcome::success(file, false)
    }
}

#[async_trait]
impl SourceApi for FakeSource {
    async fn upload_chunk(&self, chunk: &UploadChunk) -> Result<UploadChunkResponse> {
        let sequence = self.tokens.fetch_add(1, Ordering::SeqCst);
        let token = format!("token-{sequence}");
        self.uploaded
            .lock()
            .extend(chunk.upload_candidates.iter().cloned());
        self.pending
            .lock()
            .insert(token.clone(), chunk.upload_candidates.clone());
        let mut stop_on_upload = self.stop_on_upload.lock();
        if stop_on_upload
            .as_ref()
            .is_some_and(|(after, _)| sequence + 1 >= *after)
        {
            if let Some((_, stop)) = stop_on_upload.take() {
                stop.trigger();
            }
        }
        drop(stop_on_upload);
        Ok(UploadChunkResponse {
            node_id: NODE.to_string(),
            uuid_token: token,
        })
    }

    async fn sync_chunks(
        &self,
        body: &UploadChunksStatusBody,
    ) -> Result<UploadChunksStatusResponse> {
        self.delete_requests
            .lock()
            .extend(body.chunks_to_delete.iter().cloned());
        let mut chunks_status = Vec::new();
        for token in &body.awaiting_status_chunks {
            let Some(files) = self.pending.lock().remove(token) else {
                continue;
            };
            if let Some(lost) = &self.lose {
                if files.iter().any(|file| &file.name == lost) {
                    continue;
                }
            }
            self.done_tokens.lock().insert(token.clone());
            chunks_status.push(ChunkStatus {
                uuid_token: token.clone(),
                status: ProcessStatus::Done,
                files: files.into_iter().map(|file| self.outcome(file)).collect(),
                duration_millis: 5,
            });
        }
        Ok(UploadChunksStatusResponse {
            node_id: NODE.to_string(),
            chunks_status,
            deleted_chunks: body.chunks_to_delete.clone(),
        })
    }

    async fn store_properties(&self, _repo_key: &str) -> Result<()> {
        Ok(())
    }

    async fn handle_properties_diff(
        &self,
        _request: &HandlePropertiesDiff,
    ) -> Result<HandlePropertiesDiffResponse> {
        Ok(HandlePropertiesDiffResponse {
            node_id: NODE.to_string(),
            status: ProcessStatus::Done,
            ..Default::default()
        })
    }

    async fn stop(&self) -> Result<String> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(NODE.to_string())
    }

    async fn verify_compatibility(&self) -> Result<VerifyCompatibilityResponse> {
        Ok(VerifyCompatibilityResponse::default())
    }

    async fn data_transfer_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn verify_connectivity(&self, _auth: &TargetAuth) -> Result<()> {
        Ok(())
    }

    async fn ping_node(&self) -> Result<String> {
        Ok(NODE.to_string())
    }

    async fn repositories(&self) -> Result<Vec<RepoSummary>> {
        Ok(self.repos.clone())
    }

    async fn list_directory(&self, repo: &str, path: &str, page: usize) -> Result<Vec<ListItem>> {
        let mut items = self
            .listings
            .get(&(repo.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_default();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items
            .into_iter()
            .skip(page * PAGINATION_LIMIT)
            .take(PAGINATION_LIMIT)
            .collect())
    }

    async fn search_modified(
        &self,
        repo: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<ListItem>> {
        if page > 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .modified
            .lock()
            .iter()
            .filter(|item| item.repo == repo)
            .cloned()
            .collect())
    }

    async fn search_manifests(
        &self,
        repo: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<ListItem>> {
        if page > 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .manifests
            .lock()
            .iter()
            .filter(|item| item.repo == repo)
            .cloned()
            .collect())
    }
}

struct FakeTarget(Vec<String>);

#[async_trait]
impl TargetApi for FakeTarget {
    async fn repository_keys(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

fn fast_timings() -> Timings {
    Timings {
        poll_interval: Duration::from_millis(10),
        idle_grace: Duration::from_millis(50),
        settings_refresh: Duration::from_millis(50),
        snapshot_save_interval: Duration::from_millis(100),
        properties_poll: Duration::from_millis(10),
        ..Timings::default()
    }
}

fn config(working_dir: &Path) -> anyhow::Result<TransferConfig> {
    let mut config = TransferConfig::from_toml(
        r#"
        threads = 4

        [source]
        url = "http://source.example"

        [target]
        url = "http://target.example"
        "#,
    )?;
    config.working_dir = Some(working_dir.to_path_buf());
    Ok(config)
}

fn coordinator(
    working_dir: &Path,
    source: &Arc<FakeSource>,
    target: &[&str],
) -> anyhow::Result<TransferCoordinator> {
    let target = Arc::new(FakeTarget(target.iter().map(|s| s.to_string()).collect()));
    Ok(
        TransferCoordinator::new(config(working_dir)?, source.clone(), target)?
            .with_timings(fast_timings()),
    )
}

fn repo_state(working_dir: &Path, repo: &str) -> anyhow::Result<TransferState> {
    let paths = RepoPaths::new(working_dir, repo);
    TransferState::load(&paths.state_file())?
        .ok_or_else(|| anyhow::anyhow!("no state saved for {repo}"))
}

#[tokio::test]
async fn test_full_transfer_uploads_every_file_once() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(
        FakeSource::new()
            .repo(
                "generic-local",
                PackageType::Other("generic".into()),
                &[("a.txt", 10), ("docs/b.txt", 20), ("docs/deep/c.txt", 30)],
            )
            .repo("missing-local", PackageType::Other("generic".into()), &[("x.bin", 1)]),
    );

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    let mut files = source.uploaded_files();
    files.sort();
    assert_eq!(
        files,
        vec![
            "generic-local/a.txt",
            "generic-local/docs/b.txt",
            "generic-local/docs/deep/c.txt",
        ]
    );

    let state = repo_state(dir.path(), "generic-local")?;
    assert!(state.is_repo_transferred());
    assert_eq!(state.repository.progress.transferred_units, 3);
    assert_eq!(state.repository.progress.transferred_size_bytes, 60);
    assert!(!RepoPaths::new(dir.path(), "generic-local")
        .snapshot_file()
        .exists());

    let run = TransferRunStatus::load(&dir.path().join(RUN_STATUS_FILE))?
        .ok_or_else(|| anyhow::anyhow!("no run status"))?;
    assert_eq!(run.total_repositories.total_units, 1);
    assert_eq!(run.total_repositories.transferred_units, 1);
    assert_eq!(run.overall_transfer.transferred_units, 3);
    assert_eq!(run.transfer_failures, 0);
    assert_eq!(run.source_nodes, vec![NODE.to_string()]);
    assert!(StateManager::running_since(dir.path())?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_second_run_only_transfers_the_diff() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(FakeSource::new().repo(
        "generic-local",
        PackageType::Other("generic".into()),
        &[("a.txt", 10), ("b.txt", 20)],
    ));

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;
    assert_eq!(source.uploaded_files().len(), 2);

    source.set_modified("generic-local", ".", "new.txt", 5);
    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    let files = source.uploaded_files();
    assert_eq!(files.len(), 3);
    assert_eq!(files[2], "generic-local/new.txt");

    let state = repo_state(dir.path(), "generic-local")?;
    assert_eq!(state.repository.diffs.len(), 2);
    assert!(state.repository.diffs.iter().all(|diff| diff.completed));
    assert_eq!(state.repository.diff_progress.transferred_units, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_file_is_retried_and_poms_go_last() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(
        FakeSource::new()
            .repo(
                "libs-release",
                PackageType::Maven,
                &[
                    ("org/acme/app/1.0/app-1.0.jar", 100),
                    ("org/acme/app/1.0/app-1.0.pom", 2),
                    ("org/acme/lib/1.0/lib-1.0.jar", 50),
                    ("org/acme/lib/1.0/lib-1.0.pom", 1),
                ],
            )
            .fail_once("lib-1.0.jar"),
    );

    coordinator(dir.path(), &source, &["libs-release"])?
        .run()
        .await?;

    let files = source.uploaded_files();
    let last_jar = files
        .iter()
        .rposition(|file| file.ends_with(".jar"))
        .ok_or_else(|| anyhow::anyhow!("no jar uploaded"))?;
    let first_pom = files
        .iter()
        .position(|file| file.ends_with(".pom"))
        .ok_or_else(|| anyhow::anyhow!("no pom uploaded"))?;
    assert!(last_jar < first_pom, "poms must follow every jar: {files:?}");
    assert_eq!(files.iter().filter(|f| f.ends_with(".pom")).count(), 2);
    assert_eq!(
        files
            .iter()
            .filter(|f| f.ends_with("lib-1.0.jar"))
            .count(),
        2
    );

    let paths = RepoPaths::new(dir.path(), "libs-release");
    assert!(errors::list_pending(&paths)?.is_empty());
    assert!(delayed::list_delay_files(&paths)?.is_empty());
    let run = TransferRunStatus::load(&dir.path().join(RUN_STATUS_FILE))?
        .ok_or_else(|| anyhow::anyhow!("no run status"))?;
    assert_eq!(run.transfer_failures, 0);
    Ok(())
}

#[tokio::test]
async fn test_stopped_transfer_resumes_from_snapshot() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let all = [
        "generic-local/a/1.txt",
        "generic-local/b/2.txt",
        "generic-local/c/3.txt",
        "generic-local/d/4.txt",
    ];
    let source = Arc::new(FakeSource::new().repo(
        "generic-local",
        PackageType::Other("generic".into()),
        &[("a/1.txt", 1), ("b/2.txt", 2), ("c/3.txt", 3), ("d/4.txt", 4)],
    ));

    let first = coordinator(dir.path(), &source, &["generic-local"])?;
    *source.stop_on_upload.lock() = Some((2, first.stop_signal()));
    first.run().await?;

    let paths = RepoPaths::new(dir.path(), "generic-local");
    assert!(!repo_state(dir.path(), "generic-local")?.is_repo_transferred());
    assert!(paths.snapshot_file().exists());

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    let mut files = source.uploaded_files();
    files.sort();
    files.dedup();
    assert_eq!(files, all);
    assert!(repo_state(dir.path(), "generic-local")?.is_repo_transferred());
    assert!(!paths.snapshot_file().exists());
    Ok(())
}

#[tokio::test]
async fn test_stop_before_start_transfers_nothing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(FakeSource::new().repo(
        "generic-local",
        PackageType::Other("generic".into()),
        &[("a.txt", 10)],
    ));
    let coordinator = coordinator(dir.path(), &source, &["generic-local"])?;
    coordinator.stop_signal().trigger();

    coordinator.run().await?;

    assert!(source.uploaded_files().is_empty());
    assert!(source.stops.load(Ordering::SeqCst) >= 1);
    assert!(StateManager::running_since(dir.path())?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_old_plugin_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut source = FakeSource::new();
    source.version = "1.6.9".to_string();
    let source = Arc::new(source);

    let result = coordinator(dir.path(), &source, &[])?.run().await;

    assert!(matches!(result, Err(TransferError::Incompatible(_))));
    assert!(source.uploaded_files().is_empty());
    Ok(())
}

fn pending_errors(working_dir: &Path, repo: &str) -> anyhow::Result<Vec<ErrorEntry>> {
    let mut entries = Vec::new();
    for file in errors::list_pending(&RepoPaths::new(working_dir, repo))? {
        entries.extend(errors::read_error_file(&file)?);
    }
    Ok(entries)
}

fn run_status(working_dir: &Path) -> anyhow::Result<TransferRunStatus> {
    TransferRunStatus::load(&working_dir.join(RUN_STATUS_FILE))?
        .ok_or_else(|| anyhow::anyhow!("no run status"))
}

#[tokio::test]
async fn test_full_page_with_self_entry_is_followed_by_next_page() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    // Page 0 is the root's own row plus 9999 files; the last file is on page 1.
    let mut names: Vec<String> = (0..PAGINATION_LIMIT - 1)
        .map(|i| format!("f{i:05}.bin"))
        .collect();
    names.push("zzz-last.bin".to_string());
    let source = Arc::new(FakeSource::new().flat_repo("generic-local", &names, true));

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    let files = source.uploaded_files();
    assert_eq!(files.len(), PAGINATION_LIMIT);
    assert!(files.contains(&"generic-local/zzz-last.bin".to_string()));
    let unique: HashSet<&String> = files.iter().collect();
    assert_eq!(unique.len(), PAGINATION_LIMIT);
    assert!(repo_state(dir.path(), "generic-local")?.is_repo_transferred());
    Ok(())
}

#[tokio::test]
async fn test_docker_diff_uploads_manifest_directories() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(FakeSource::new().repo(
        "docker-local",
        PackageType::Docker,
        &[
            ("image/1.0/manifest.json", 1),
            ("image/1.0/sha256__a", 100),
            ("image/2.0/manifest.json", 1),
            ("image/2.0/sha256__b", 200),
        ],
    ));

    coordinator(dir.path(), &source, &["docker-local"])?
        .run()
        .await?;
    let first_run = source.uploaded_files().len();
    assert_eq!(first_run, 4);

    source.set_manifest("docker-local", "image/1.0");
    coordinator(dir.path(), &source, &["docker-local"])?
        .run()
        .await?;

    let files = source.uploaded_files();
    assert_eq!(
        files[first_run..].to_vec(),
        vec![
            "docker-local/image/1.0/sha256__a".to_string(),
            "docker-local/image/1.0/manifest.json".to_string(),
        ]
    );
    let paths = RepoPaths::new(dir.path(), "docker-local");
    assert!(errors::list_pending(&paths)?.is_empty());
    assert!(delayed::list_delay_files(&paths)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_during_retry_keeps_each_failure_once() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let names: Vec<String> = (0..40).map(|i| format!("f{i:02}.bin")).collect();
    let mut source = FakeSource::new().flat_repo("generic-local", &names, false);
    for name in &names {
        source = source.fail_once(name);
    }
    let source = Arc::new(source);

    // Three failing chunks in the full transfer, then the stop arrives with
    // the first retried chunk.
    let first = coordinator(dir.path(), &source, &["generic-local"])?;
    *source.stop_on_upload.lock() = Some((4, first.stop_signal()));
    first.run().await?;

    let before_retry = source.uploaded_files().len();
    let pending = pending_errors(dir.path(), "generic-local")?;
    let mut pending_names: Vec<String> = pending
        .iter()
        .map(|entry| entry.outcome.file.full_path())
        .collect();
    pending_names.sort();
    let unique: HashSet<&String> = pending_names.iter().collect();
    assert_eq!(unique.len(), pending_names.len(), "{pending_names:?}");
    assert!(!pending_names.is_empty());
    assert_eq!(
        run_status(dir.path())?.transfer_failures as usize,
        pending_names.len()
    );

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    let mut retried = source.uploaded_files()[before_retry..].to_vec();
    retried.sort();
    assert_eq!(retried, pending_names);
    assert!(pending_errors(dir.path(), "generic-local")?.is_empty());
    assert_eq!(run_status(dir.path())?.transfer_failures, 0);
    Ok(())
}

#[tokio::test]
async fn test_done_chunks_are_acknowledged_once() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let names: Vec<String> = (0..100).map(|i| format!("f{i:03}.bin")).collect();
    let source = Arc::new(FakeSource::new().flat_repo("generic-local", &names, false));

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    let files = source.uploaded_files();
    assert_eq!(files.len(), 100);
    assert_eq!(files.iter().collect::<HashSet<_>>().len(), 100);
    assert!(pending_errors(dir.path(), "generic-local")?.is_empty());

    let done = source.done_tokens.lock().clone();
    let requests = source.delete_requests.lock().clone();
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|token| done.contains(token)));
    let unique: HashSet<&String> = requests.iter().collect();
    assert_eq!(unique.len(), requests.len(), "{requests:?}");
    Ok(())
}

#[tokio::test]
async fn test_chunk_unknown_to_node_is_recorded_as_failed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(
        FakeSource::new()
            .repo(
                "generic-local",
                PackageType::Other("generic".into()),
                &[("keep.txt", 1), ("lost/lost.bin", 2)],
            )
            .lose("lost.bin"),
    );

    coordinator(dir.path(), &source, &["generic-local"])?
        .run()
        .await?;

    // Uploaded by the full transfer, then once more by the retry phase.
    let files = source.uploaded_files();
    assert_eq!(
        files
            .iter()
            .filter(|file| file.ends_with("lost/lost.bin"))
            .count(),
        2
    );
    assert_eq!(
        files
            .iter()
            .filter(|file| file.ends_with("keep.txt"))
            .count(),
        1
    );

    let pending = pending_errors(dir.path(), "generic-local")?;
    let lost: Vec<&ErrorEntry> = pending
        .iter()
        .filter(|entry| entry.outcome.file.name == "lost.bin")
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].outcome.status_code, SYNC_ERROR_STATUS_CODE);
    assert_eq!(lost[0].outcome.reason, SYNC_ERROR_REASON);
    assert!(pending
        .iter()
        .all(|entry| entry.outcome.file.name != "keep.txt"));
    Ok(())
}

#[tokio::test]
async fn test_phase_completion_is_saved_at_once() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = Arc::new(FakeSource::new());
    let repo = RepoSummary::new("generic-local", PackageType::Other("generic".into()));
    // Throttled saves would never reach the disk within this test.
    let state = Arc::new(StateManager::new(dir.path(), Duration::from_secs(3600))?);
    state.set_repo_state(&repo.key, ProgressState::default(), false, false)?;
    let ctx = PhaseContext {
        paths: RepoPaths::new(dir.path(), &repo.key),
        repo,
        source: source.clone(),
        state,
        config: Arc::new(config(dir.path())?),
        timings: fast_timings(),
        stop: StopSignal::new(),
        clock: Arc::new(SystemClock),
        threads: 4,
    };

    let full = FullTransferPhase::new(ctx.clone());
    full.started().await?;
    full.done().await?;
    assert!(repo_state(dir.path(), "generic-local")?.is_repo_transferred());

    let diff = FilesDiffPhase::new(ctx);
    diff.started().await?;
    let saved = repo_state(dir.path(), "generic-local")?;
    assert_eq!(saved.repository.diffs.len(), 1);
    assert!(!saved.repository.diffs[0].completed);

    diff.done().await?;
    let saved = repo_state(dir.path(), "generic-local")?;
    assert!(saved.repository.diffs[0].completed);
    Ok(())
}
