//! State manager: in-memory state with throttled persistence and the run lock.

use super::run_status::{StaleChunks, TransferRunStatus};
use super::transfer_state::{ProgressState, TransferState};
use super::{RepoPaths, LOCK_FILE, RUN_STATUS_FILE};
use crate::error::{Result, TransferError};
use crate::transfer::chunk::{ChunkStatus, FileStatus};
use crate::transfer::phase::PhaseId;
use chrono::{DateTime, TimeZone, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default minimum time between two throttled saves
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(10);

/// Both state documents, mutated together under one lock.
#[derive(Debug, Clone, Default)]
pub struct StateData {
    pub repo: TransferState,
    pub run: TransferRunStatus,
}

pub struct StateManager {
    working_dir: PathBuf,
    data: Mutex<StateData>,
    last_save: Mutex<Option<Instant>>,
    save_interval: Duration,
    lock_file: Mutex<Option<fs::File>>,
    started: Mutex<DateTime<Utc>>,
}

impl StateManager {
    /// State manager for a fresh run. The run status starts from zero.
    pub fn new(working_dir: &Path, save_interval: Duration) -> Result<Self> {
        fs::create_dir_all(working_dir)?;
        Ok(Self {
            working_dir: working_dir.to_path_buf(),
            data: Mutex::new(StateData {
                repo: TransferState::default(),
                run: TransferRunStatus::new(),
            }),
            last_save: Mutex::new(None),
            save_interval,
            lock_file: Mutex::new(None),
            started: Mutex::new(Utc::now()),
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn started(&self) -> DateTime<Utc> {
        *self.started.lock()
    }

    // =========================================================================
    // Run lock
    // =========================================================================

    /// Mark a transfer as running. Fails if another process holds the lock.
    pub fn try_lock(&self) -> Result<()> {
        let path = self.working_dir.join(LOCK_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(TransferError::AlreadyRunning);
        }
        let now = Utc::now();
        file.set_len(0)?;
        write!(file, "{}", now.timestamp_millis())?;
        file.sync_all()?;
        *self.started.lock() = now;
        *self.lock_file.lock() = Some(file);
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        if let Some(file) = self.lock_file.lock().take() {
            let _ = fs::remove_file(self.working_dir.join(LOCK_FILE));
            file.unlock()?;
        }
        Ok(())
    }

    /// Start time of the transfer currently running from `working_dir`, if any.
    pub fn running_since(working_dir: &Path) -> Result<Option<DateTime<Utc>>> {
        let path = working_dir.join(LOCK_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.try_lock_shared().is_ok() {
            // Nobody holds it; left over from a crashed run.
            file.unlock()?;
            return Ok(None);
        }
        let millis: i64 = fs::read_to_string(&path)?.trim().parse().unwrap_or(0);
        Ok(Utc.timestamp_millis_opt(millis).single())
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Apply `mutator`, then save unless a save happened within the save
    /// interval or another save is in progress.
    pub fn action<F>(&self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut StateData),
    {
        mutator(&mut self.data.lock());

        let Some(mut last_save) = self.last_save.try_lock() else {
            return Ok(());
        };
        if last_save.is_some_and(|at| at.elapsed() < self.save_interval) {
            return Ok(());
        }
        *last_save = Some(Instant::now());
        self.encode()?.write()
    }

    /// Read from the in-memory state.
    pub fn read<R>(&self, reader: impl FnOnce(&StateData) -> R) -> R {
        reader(&self.data.lock())
    }

    /// Save both documents now, regardless of the throttle.
    pub fn save_now(&self) -> Result<()> {
        let mut last_save = self.last_save.lock();
        *last_save = Some(Instant::now());
        self.encode()?.write()
    }

    /// Serialize the current state. The data lock is held for serialization
    /// only; callers write while holding `last_save`, which keeps saves in
    /// order.
    fn encode(&self) -> Result<EncodedState> {
        let data = self.data.lock();
        let repo = if data.repo.repository.name.is_empty() {
            None
        } else {
            let paths = RepoPaths::new(&self.working_dir, &data.repo.repository.name);
            Some((paths, serde_json::to_vec(&data.repo)?))
        };
        Ok(EncodedState {
            run_status_file: self.working_dir.join(RUN_STATUS_FILE),
            run: serde_json::to_vec(&data.run)?,
            repo,
        })
    }

    // =========================================================================
    // Repository and run bookkeeping
    // =========================================================================

    /// Switch to `repo`, loading its saved state unless `reset` is set.
    pub fn set_repo_state(
        &self,
        repo: &str,
        total: ProgressState,
        build_info_repo: bool,
        reset: bool,
    ) -> Result<()> {
        let paths = RepoPaths::new(&self.working_dir, repo);
        let mut state = if reset {
            TransferState::new(repo)
        } else {
            TransferState::load(&paths.state_file())?.unwrap_or_else(|| TransferState::new(repo))
        };
        state.repository.progress.total_size_bytes = total.total_size_bytes;
        state.repository.progress.total_units = total.total_units;

        {
            let mut data = self.data.lock();
            data.repo = state;
            data.run.current_repo = repo.to_string();
            data.run.build_info_repo = build_info_repo;
        }
        self.save_now()
    }

    pub fn is_repo_transferred(&self) -> bool {
        self.read(|data| data.repo.is_repo_transferred())
    }

    pub fn set_phase(&self, phase: PhaseId) -> Result<()> {
        self.action(|data| data.run.current_repo_phase = phase.index())
    }

    pub fn current_phase(&self) -> usize {
        self.read(|data| data.run.current_repo_phase)
    }

    pub fn set_working_threads(&self, threads: usize) -> Result<()> {
        self.action(|data| data.run.working_threads = threads)
    }

    pub fn working_threads(&self) -> usize {
        self.read(|data| data.run.working_threads)
    }

    pub fn set_source_nodes(&self, nodes: Vec<String>) -> Result<()> {
        self.action(|data| data.run.source_nodes = nodes)
    }

    pub fn set_stale_chunks(&self, stale: Vec<StaleChunks>) -> Result<()> {
        self.action(|data| data.run.stale_chunks = stale)
    }

    /// Adjust the failure counter; retried files are taken back off.
    pub fn change_failures(&self, count: u64, increase: bool) -> Result<()> {
        self.action(|data| {
            if increase {
                data.run.transfer_failures += count;
            } else {
                data.run.transfer_failures = data.run.transfer_failures.saturating_sub(count);
            }
        })
    }

    pub fn inc_repositories_transferred(&self) -> Result<()> {
        self.action(|data| data.run.total_repositories.transferred_units += 1)
    }

    /// Add files found by Files-Diff to the diff totals.
    pub fn inc_diff_totals(&self, files: u64, bytes: u64) -> Result<()> {
        self.action(|data| {
            data.repo.repository.diff_progress.total_units += files;
            data.repo.repository.diff_progress.total_size_bytes += bytes;
        })
    }

    /// Count a finished chunk in the progress counters and the estimator.
    /// Returns the bytes it transferred.
    pub fn update_chunk(&self, status: &ChunkStatus, duration_millis: u64) -> Result<u64> {
        let (files, bytes) = status
            .files
            .iter()
            .filter(|file| file.status == FileStatus::Success && !file.file.is_directory())
            .fold((0u64, 0u64), |(files, bytes), file| {
                (files + 1, bytes + file.size_bytes)
            });

        self.action(|data| {
            data.repo.repository.progress.add_transferred(files, bytes);
            if data.run.current_repo_phase == PhaseId::FilesDiff.index() {
                data.repo.repository.diff_progress.add_transferred(files, bytes);
            }
            data.run.overall_transfer.add_transferred(files, bytes);
            if data.run.build_info_repo {
                data.run.overall_bi_files.transferred_units += files;
            }
            let threads = data.run.working_threads;
            data.run
                .time_estimation
                .add_chunk_status(status, duration_millis, threads);
        })?;
        Ok(bytes)
    }
}

/// Both documents, serialized and ready to be written.
struct EncodedState {
    run_status_file: PathBuf,
    run: Vec<u8>,
    repo: Option<(RepoPaths, Vec<u8>)>,
}

impl EncodedState {
    fn write(self) -> Result<()> {
        write_atomic(&self.run_status_file, &self.run)?;
        if let Some((paths, repo)) = self.repo {
            fs::create_dir_all(paths.root())?;
            write_atomic(&paths.state_file(), &repo)?;
        }
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let temp_file = path.with_extension("tmp");
    fs::write(&temp_file, content).map_err(|source| TransferError::WriteFile {
        path: temp_file.clone(),
        source,
    })?;
    fs::rename(&temp_file, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::chunk::{FileCandidate, FileOutcome};
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let first = StateManager::new(dir.path(), DEFAULT_SAVE_INTERVAL).unwrap();
        let second = StateManager::new(dir.path(), DEFAULT_SAVE_INTERVAL).unwrap();
        first.try_lock().unwrap();
        assert!(matches!(second.try_lock(), Err(TransferError::AlreadyRunning)));
        assert!(StateManager::running_since(dir.path()).unwrap().is_some());

        first.unlock().unwrap();
        assert!(StateManager::running_since(dir.path()).unwrap().is_none());
        second.try_lock().unwrap();
        second.unlock().unwrap();
    }

    #[test]
    fn test_action_throttles_saves() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path(), Duration::from_secs(3600)).unwrap();
        manager.set_working_threads(4).unwrap();
        let path = dir.path().join(RUN_STATUS_FILE);
        let saved = TransferRunStatus::load(&path).unwrap().unwrap();
        assert_eq!(saved.working_threads, 4);

        // Within the interval: memory changes, disk does not.
        manager.set_working_threads(9).unwrap();
        assert_eq!(manager.working_threads(), 9);
        let saved = TransferRunStatus::load(&path).unwrap().unwrap();
        assert_eq!(saved.working_threads, 4);

        manager.save_now().unwrap();
        let saved = TransferRunStatus::load(&path).unwrap().unwrap();
        assert_eq!(saved.working_threads, 9);
    }

    #[test]
    fn test_readers_not_blocked_by_waiting_save() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path(), Duration::ZERO).unwrap();
        manager.set_working_threads(3).unwrap();

        // A save in progress elsewhere holds `last_save`.
        let in_progress = manager.last_save.lock();
        std::thread::scope(|scope| {
            let saver = scope.spawn(|| manager.save_now());
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(manager.working_threads(), 3);
            // Throttled actions skip the save instead of queueing behind it.
            manager.set_working_threads(5).unwrap();
            assert_eq!(manager.working_threads(), 5);
            drop(in_progress);
            saver.join().unwrap().unwrap();
        });

        let saved = TransferRunStatus::load(&dir.path().join(RUN_STATUS_FILE))
            .unwrap()
            .unwrap();
        assert_eq!(saved.working_threads, 5);
    }

    #[test]
    fn test_repo_state_survives_and_resets() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path(), Duration::ZERO).unwrap();
        manager
            .set_repo_state("libs", ProgressState::default(), false, false)
            .unwrap();
        manager
            .action(|data| data.repo.set_full_transfer_completed(Utc::now()))
            .unwrap();

        let next = StateManager::new(dir.path(), Duration::ZERO).unwrap();
        next.set_repo_state("libs", ProgressState::default(), false, false)
            .unwrap();
        assert!(next.is_repo_transferred());
        next.set_repo_state("libs", ProgressState::default(), false, true)
            .unwrap();
        assert!(!next.is_repo_transferred());
    }

    #[test]
    fn test_update_chunk_counts_successes() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path(), Duration::ZERO).unwrap();
        manager
            .set_repo_state("libs", ProgressState::default(), false, false)
            .unwrap();
        manager.set_working_threads(1).unwrap();
        let status = ChunkStatus {
            files: vec![
                FileOutcome::success(FileCandidate::file("libs", ".", "a", 10), false),
                FileOutcome::failed(FileCandidate::file("libs", ".", "b", 20), 500, "x"),
            ],
            ..Default::default()
        };
        assert_eq!(manager.update_chunk(&status, 5).unwrap(), 10);
        manager.read(|data| {
            assert_eq!(data.repo.repository.progress.transferred_units, 1);
            assert_eq!(data.run.overall_transfer.transferred_size_bytes, 10);
            assert_eq!(data.run.time_estimation.last_speeds.len(), 1);
        });
    }
}
