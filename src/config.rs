//! Run configuration and hot-reloadable thread settings.
//!
//! `TransferConfig` is read once from TOML when a run starts. The thread count
//! lives in a separate `settings.json` so it can be changed while a transfer is
//! running; the refresher task re-reads it periodically.

use crate::api::TargetAuth;
use crate::error::{Result, TransferError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of working threads
pub const DEFAULT_THREADS: usize = 8;

/// Cap applied to both pools while transferring a build-info repository
pub const MAX_BUILD_INFO_THREADS: usize = 8;

/// Cap applied to the chunk builder pool
pub const MAX_CHUNK_BUILDER_THREADS: usize = 16;

const SETTINGS_FILE: &str = "settings.json";

/// Connection details for one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub access_token: String,
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}
fn default_poll_interval() -> u64 {
    3
}
fn default_idle_grace() -> u64 {
    15
}
fn default_settings_refresh() -> u64 {
    20
}
fn default_save_interval() -> u64 {
    10
}
fn default_diff_window() -> i64 {
    15
}
fn default_lru_capacity() -> usize {
    50
}
fn default_max_spill_entries() -> usize {
    50_000
}

/// Top-level configuration of a transfer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub source: ServerConfig,
    pub target: ServerConfig,

    /// Directory holding state, snapshots and spillover files
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Initial working threads, overridden by `settings.json` when present
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Glob patterns of repositories to transfer (all when empty)
    #[serde(default)]
    pub include_repos: Vec<String>,

    /// Glob patterns of repositories to leave out
    #[serde(default)]
    pub exclude_repos: Vec<String>,

    /// Start over, discarding previous state, errors and delays
    #[serde(default)]
    pub ignore_state: bool,

    #[serde(default)]
    pub proxy_key: Option<String>,

    /// Ask the source to replay property changes during Files-Diff
    #[serde(default)]
    pub properties_diff: bool,

    /// Let the target skip files whose checksum it already stores
    #[serde(default)]
    pub check_existence_in_filestore: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,

    #[serde(default = "default_settings_refresh")]
    pub settings_refresh_secs: u64,

    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,

    #[serde(default = "default_diff_window")]
    pub diff_window_minutes: i64,

    #[serde(default = "default_lru_capacity")]
    pub lru_capacity: usize,

    #[serde(default = "default_max_spill_entries")]
    pub max_entries_per_spill_file: usize,
}

impl TransferConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: TransferConfig =
            toml::from_str(text).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| TransferError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() || self.target.url.is_empty() {
            return Err(TransferError::Config(
                "both source.url and target.url are required".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(TransferError::Config(
                "threads must be at least 1".to_string(),
            ));
        }
        for pattern in self.include_repos.iter().chain(&self.exclude_repos) {
            glob::Pattern::new(pattern)
                .map_err(|e| TransferError::Config(format!("invalid pattern '{pattern}': {e}")))?;
        }
        Ok(())
    }

    /// Resolved working directory (`~/.repo-transfer` unless configured).
    pub fn working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_working_dir(),
        }
    }

    /// True if `repo` passes the include/exclude patterns.
    pub fn selects_repo(&self, repo: &str) -> bool {
        let matches = |patterns: &[String]| {
            patterns.iter().any(|p| {
                glob::Pattern::new(p)
                    .map(|pattern| pattern.matches(repo))
                    .unwrap_or(false)
            })
        };
        (self.include_repos.is_empty() || matches(&self.include_repos))
            && !matches(&self.exclude_repos)
    }

    pub fn target_auth(&self) -> TargetAuth {
        let mut url = self.target.url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        TargetAuth {
            target_artifactory_url: url,
            target_username: self.target.user.clone(),
            target_password: self.target.password.clone(),
            target_token: self.target.access_token.clone(),
            target_proxy_key: self.proxy_key.clone().unwrap_or_default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn settings_refresh(&self) -> Duration {
        Duration::from_secs(self.settings_refresh_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            poll_interval: self.poll_interval(),
            idle_grace: self.idle_grace(),
            settings_refresh: self.settings_refresh(),
            diff_window: chrono::Duration::minutes(self.diff_window_minutes.max(1)),
            ..Timings::default()
        }
    }
}

/// Every interval the engine waits on, gathered so tests can shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Between two chunk status polls, and admission retries
    pub poll_interval: Duration,
    /// How long pools must stay empty before a phase is considered done
    pub idle_grace: Duration,
    /// Between two reads of the thread settings and the stop file
    pub settings_refresh: Duration,
    /// Between two snapshot saves during Full-Transfer
    pub snapshot_save_interval: Duration,
    /// Between two property-replication status polls
    pub properties_poll: Duration,
    /// Width of one Files-Diff search window
    pub diff_window: chrono::Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(default_poll_interval()),
            idle_grace: Duration::from_secs(default_idle_grace()),
            settings_refresh: Duration::from_secs(default_settings_refresh()),
            snapshot_save_interval: Duration::from_secs(10 * 60),
            properties_poll: Duration::from_secs(5),
            diff_window: chrono::Duration::minutes(default_diff_window()),
        }
    }
}

/// Get the default working directory (~/.repo-transfer/)
pub fn default_working_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        TransferError::Config("Cannot determine home directory (HOME not set)".to_string())
    })?;
    Ok(home.join(".repo-transfer"))
}

// =============================================================================
// Thread settings
// =============================================================================

/// Live-tunable settings, stored next to the transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSettings {
    pub threads_number: usize,
}

impl ThreadSettings {
    fn path(working_dir: &Path) -> PathBuf {
        working_dir.join(SETTINGS_FILE)
    }

    /// Read the settings file. `None` when it does not exist yet.
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(working_dir);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = fs::File::open(&path)?;
        file.lock_shared()?;
        let mut text = String::new();
        let read = file.read_to_string(&mut text);
        file.unlock()?;
        read?;
        let settings: ThreadSettings = serde_json::from_str(&text)?;
        if settings.threads_number == 0 {
            return Err(TransferError::Config(
                "threads_number must be at least 1".to_string(),
            ));
        }
        Ok(Some(settings))
    }

    /// Write the settings file under an exclusive lock.
    pub fn save(&self, working_dir: &Path) -> Result<()> {
        if self.threads_number == 0 {
            return Err(TransferError::Config(
                "threads_number must be at least 1".to_string(),
            ));
        }
        fs::create_dir_all(working_dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(Self::path(working_dir))?;
        file.lock_exclusive()?;
        let result = (|| -> Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(serde_json::to_string(self)?.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })();
        file.unlock()?;
        result
    }
}

/// Worker counts for one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub builders: usize,
    pub uploaders: usize,
}

/// Derive pool sizes from the configured thread count.
pub fn pool_sizes(threads: usize, build_info_repo: bool) -> PoolSizes {
    let mut uploaders = threads.max(1);
    let mut builders = uploaders;
    if build_info_repo {
        uploaders = uploaders.min(MAX_BUILD_INFO_THREADS);
        builders = builders.min(MAX_BUILD_INFO_THREADS);
    }
    PoolSizes {
        builders: builders.min(MAX_CHUNK_BUILDER_THREADS),
        uploaders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
        [source]
        url = "http://source/artifactory"
        access_token = "abc"

        [target]
        url = "http://target/artifactory/"
        user = "admin"
        password = "secret"
    "#;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.idle_grace(), Duration::from_secs(15));
        assert_eq!(config.diff_window_minutes, 15);
        assert_eq!(config.lru_capacity, 50);
        assert!(!config.properties_diff);
        assert_eq!(config.timings(), Timings::default());
        assert_eq!(
            config.target_auth().target_artifactory_url,
            "http://target/artifactory/"
        );
    }

    #[test]
    fn test_missing_url_rejected() {
        let text = "[source]\nurl = \"\"\n[target]\nurl = \"http://t\"\n";
        assert!(matches!(
            TransferConfig::from_toml(text),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_repo_selection() {
        let mut config = TransferConfig::from_toml(MINIMAL).unwrap();
        assert!(config.selects_repo("anything"));
        config.include_repos = vec!["libs-*".into()];
        config.exclude_repos = vec!["libs-snapshot*".into()];
        assert!(config.selects_repo("libs-release"));
        assert!(!config.selects_repo("libs-snapshot-local"));
        assert!(!config.selects_repo("docker-local"));
    }

    #[test]
    fn test_thread_settings_round_trip() {
        let dir = tempdir().unwrap();
        assert!(ThreadSettings::load(dir.path()).unwrap().is_none());
        ThreadSettings { threads_number: 12 }.save(dir.path()).unwrap();
        ThreadSettings { threads_number: 3 }.save(dir.path()).unwrap();
        let loaded = ThreadSettings::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.threads_number, 3);
        assert!(ThreadSettings { threads_number: 0 }.save(dir.path()).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_default_working_dir_follows_home() {
        let dir = tempdir().unwrap();
        let previous = std::env::var_os("HOME");
        std::env::set_var("HOME", dir.path());
        let working = TransferConfig::from_toml(MINIMAL).unwrap().working_dir();
        match previous {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
        assert_eq!(working.unwrap(), dir.path().join(".repo-transfer"));
    }

    #[test]
    fn test_pool_sizes() {
        assert_eq!(pool_sizes(8, false), PoolSizes { builders: 8, uploaders: 8 });
        assert_eq!(pool_sizes(32, false), PoolSizes { builders: 16, uploaders: 32 });
        assert_eq!(pool_sizes(32, true), PoolSizes { builders: 8, uploaders: 8 });
        assert_eq!(pool_sizes(0, false), PoolSizes { builders: 1, uploaders: 1 });
    }
}
