//! Top-level driver of a transfer run.
//!
//! Takes the run lock, checks the source plugin and its connectivity to the
//! target, discovers the source nodes, then moves every selected repository
//! through the three phases. Build-info repositories go last. A stop request
//! (signal, stop file or `stop` command) ends the run gracefully: phases in
//! progress wind down and are not marked complete.

use super::errors;
use super::phase::{self, PhaseContext, PhaseId};
use super::pipeline::{Clock, StopSignal, SystemClock};
use crate::api::{
    version_at_least, RepoSummary, SourceApi, TargetApi, MIN_PLUGIN_VERSION,
};
use crate::config::{ThreadSettings, Timings, TransferConfig};
use crate::error::{Result, TransferError};
use crate::state::{ProgressState, RepoPaths, StateManager, STOP_FILE};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Pings sent to discover the nodes of a clustered source
pub const NODE_DISCOVERY_PINGS: usize = 20;

/// `stop` calls sent per known node before giving up
pub const STOP_ATTEMPTS_PER_NODE: usize = 5;

pub struct TransferCoordinator {
    config: Arc<TransferConfig>,
    source: Arc<dyn SourceApi>,
    target: Arc<dyn TargetApi>,
    working_dir: PathBuf,
    timings: Timings,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
}

impl TransferCoordinator {
    pub fn new(
        config: TransferConfig,
        source: Arc<dyn SourceApi>,
        target: Arc<dyn TargetApi>,
    ) -> Result<Self> {
        let working_dir = config.working_dir()?;
        let timings = config.timings();
        Ok(Self {
            config: Arc::new(config),
            source,
            target,
            working_dir,
            timings,
            clock: Arc::new(SystemClock),
            stop: StopSignal::new(),
        })
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle that stops this run gracefully when triggered.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run the whole transfer. Returns `AlreadyRunning` if another transfer
    /// holds the lock on the working directory.
    pub async fn run(&self) -> Result<()> {
        let state = Arc::new(StateManager::new(
            &self.working_dir,
            self.config.save_interval(),
        )?);
        state.try_lock()?;
        tracing::info!("Files transfer started");

        let mut repos = Vec::new();
        let result = self.run_locked(&state, &mut repos).await;
        if let Err(e) = &result {
            tracing::error!("Files transfer failed: {}", e);
        }

        let saved = state.save_now();
        let keys: Vec<String> = repos.iter().map(|repo| repo.key.clone()).collect();
        match errors::create_csv_summary(&self.working_dir, &keys) {
            Ok(Some(path)) => tracing::info!(
                "Transfer errors were recorded. A summary is available at {}",
                path.display()
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not create the errors summary: {}", e),
        }
        let unlocked = state.unlock();
        result?;
        saved?;
        unlocked?;
        if self.stop.is_stopped() {
            tracing::info!("Files transfer stopped");
        } else {
            tracing::info!("Files transfer is complete!");
        }
        Ok(())
    }

    async fn run_locked(&self, state: &Arc<StateManager>, repos: &mut Vec<RepoSummary>) -> Result<()> {
        self.verify_source().await?;
        tracing::info!("Verifying source to target connectivity...");
        self.source
            .verify_connectivity(&self.config.target_auth())
            .await?;

        let nodes = self.discover_nodes().await?;
        tracing::info!("Found {} source node(s)", nodes.len());
        state.set_source_nodes(nodes.clone())?;

        remove_stop_file(&self.working_dir)?;
        let watcher = tokio::spawn(watch_stop_file(
            self.working_dir.clone(),
            self.stop.clone(),
            self.timings.settings_refresh,
        ));
        let stopper = {
            let (source, stop, nodes) = (self.source.clone(), self.stop.clone(), nodes.clone());
            tokio::spawn(async move {
                stop.wait().await;
                tracing::info!("Gracefully stopping files transfer...");
                stop_source_nodes(source.as_ref(), &nodes).await;
            })
        };

        let result = self.transfer_repositories(state, repos, &nodes).await;
        watcher.abort();
        if !self.stop.is_stopped() {
            stopper.abort();
        } else if let Err(e) = stopper.await {
            tracing::debug!("Stop task ended abnormally: {}", e);
        }
        result
    }

    async fn transfer_repositories(
        &self,
        state: &Arc<StateManager>,
        repos: &mut Vec<RepoSummary>,
        nodes: &[String],
    ) -> Result<()> {
        *repos = self.select_repositories().await?;
        if self.config.ignore_state {
            for repo in repos.iter() {
                errors::remove_repo_files(&RepoPaths::new(&self.working_dir, &repo.key))?;
            }
        }

        let (size, files, build_info_files) = repos.iter().fold((0, 0, 0), |acc, repo| {
            let bi = if repo.is_build_info() { repo.files_count } else { 0 };
            (acc.0 + repo.size_bytes, acc.1 + repo.files_count, acc.2 + bi)
        });
        let repo_count = repos.len() as u64;
        state.action(|data| {
            data.run.overall_transfer.total_size_bytes = size;
            data.run.overall_transfer.total_units = files;
            data.run.total_repositories.total_units = repo_count;
            data.run.overall_bi_files.total_units = build_info_files;
        })?;

        for repo in repos.iter() {
            if self.stop.is_stopped() {
                return Ok(());
            }
            self.transfer_repository(state, repo, nodes).await?;
        }
        Ok(())
    }

    async fn transfer_repository(
        &self,
        state: &Arc<StateManager>,
        repo: &RepoSummary,
        nodes: &[String],
    ) -> Result<()> {
        tracing::info!("Transferring repository '{}'", repo.key);
        let total = ProgressState {
            total_size_bytes: repo.size_bytes,
            total_units: repo.files_count,
            ..Default::default()
        };
        state.set_repo_state(&repo.key, total, repo.is_build_info(), self.config.ignore_state)?;

        for id in PhaseId::ALL {
            if self.stop.is_stopped() {
                return Ok(());
            }
            // Clears chunks the source may still hold from an earlier run.
            stop_source_nodes(self.source.as_ref(), nodes).await;
            state.set_phase(id)?;

            let phase = phase::create_phase(id, self.phase_context(state, repo)?);
            if phase.should_skip().await? {
                continue;
            }
            tracing::info!("Phase {} of '{}': {}", id.index() + 1, repo.key, id);
            phase.started().await?;
            phase.run().await?;
            if self.stop.is_stopped() {
                return Ok(());
            }
            phase.done().await?;
        }
        state.inc_repositories_transferred()?;
        state.save_now()
    }

    fn phase_context(&self, state: &Arc<StateManager>, repo: &RepoSummary) -> Result<PhaseContext> {
        let threads = ThreadSettings::load(&self.working_dir)?
            .map(|settings| settings.threads_number)
            .unwrap_or(self.config.threads);
        Ok(PhaseContext {
            repo: repo.clone(),
            paths: RepoPaths::new(&self.working_dir, &repo.key),
            source: self.source.clone(),
            state: state.clone(),
            config: self.config.clone(),
            timings: self.timings,
            stop: self.stop.clone(),
            clock: self.clock.clone(),
            threads,
        })
    }

    async fn verify_source(&self) -> Result<()> {
        tracing::info!("Verifying the data-transfer plugin on the source...");
        let compatibility = self.source.verify_compatibility().await?;
        if !compatibility.message.is_empty() {
            tracing::info!("{}", compatibility.message);
        }
        let version = self.source.data_transfer_version().await?;
        if !version_at_least(&version, MIN_PLUGIN_VERSION) {
            return Err(TransferError::Incompatible(format!(
                "data-transfer plugin version {version} is older than the minimum {MIN_PLUGIN_VERSION}"
            )));
        }
        tracing::debug!("Data-transfer plugin version {}", version);
        Ok(())
    }

    async fn discover_nodes(&self) -> Result<Vec<String>> {
        let mut nodes = BTreeSet::new();
        for _ in 0..NODE_DISCOVERY_PINGS {
            let node = self.source.ping_node().await?;
            if !node.is_empty() {
                nodes.insert(node);
            }
        }
        Ok(nodes.into_iter().collect())
    }

    /// Source repositories to transfer, build-info repositories last.
    async fn select_repositories(&self) -> Result<Vec<RepoSummary>> {
        let target: HashSet<String> = self.target.repository_keys().await?.into_iter().collect();
        let mut selected = Vec::new();
        let mut build_info = Vec::new();
        for repo in self.source.repositories().await? {
            if !self.config.selects_repo(&repo.key) {
                continue;
            }
            if !target.contains(&repo.key) {
                tracing::warn!(
                    "Repository '{}' does not exist in the target, skipping",
                    repo.key
                );
                continue;
            }
            if repo.is_build_info() {
                build_info.push(repo);
            } else {
                selected.push(repo);
            }
        }
        selected.extend(build_info);
        Ok(selected)
    }
}

/// Call `stop` on the source until every node in `nodes` answered.
pub async fn stop_source_nodes(source: &dyn SourceApi, nodes: &[String]) {
    let mut remaining: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    for _ in 0..nodes.len() * STOP_ATTEMPTS_PER_NODE {
        if remaining.is_empty() {
            return;
        }
        match source.stop().await {
            Ok(node) => {
                tracing::debug!("Transfer stopped on node {}", node);
                remaining.remove(node.as_str());
            }
            Err(e) => tracing::error!("Could not stop the transfer on the source: {}", e),
        }
    }
    if !remaining.is_empty() {
        tracing::warn!("Transfer may still be running on nodes: {:?}", remaining);
    }
}

fn remove_stop_file(working_dir: &Path) -> Result<()> {
    match fs::remove_file(working_dir.join(STOP_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn watch_stop_file(working_dir: PathBuf, stop: StopSignal, every: std::time::Duration) {
    let path = working_dir.join(STOP_FILE);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = stop.wait() => return,
        }
        if path.exists() {
            stop.trigger();
            return;
        }
    }
}

/// Ask the transfer running from `working_dir` to stop gracefully.
pub fn request_stop(working_dir: &Path) -> Result<()> {
    if StateManager::running_since(working_dir)?.is_none() {
        return Err(TransferError::NotRunning);
    }
    let path = working_dir.join(STOP_FILE);
    if path.exists() {
        return Err(TransferError::StopInProgress);
    }
    fs::File::create(&path).map_err(|source| TransferError::WriteFile {
        path: path.clone(),
        source,
    })?;
    tracing::info!("Gracefully stopping files transfer...");
    Ok(())
}
