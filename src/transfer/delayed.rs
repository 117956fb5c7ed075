//! Delayed-artifact manager.
//!
//! Some files must reach the target only after the rest of their repository
//! (Maven POMs, Docker manifests, Conan recipes). Such files are diverted to a
//! single spillover stream and offered again in a later pass, with the
//! predicate that delayed them dropped from the head of the list. The pass
//! repeats until no predicates are left.

use super::chunk::FileCandidate;
use super::spill::{self, SpillConfig, SpillQueue, SpillWriter};
use crate::api::PackageType;
use crate::error::Result;
use crate::state::RepoPaths;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

const DELAYS_KEY: &str = "delayed_artifacts";

/// Test over a file name; true means "upload later".
pub type DelayPredicate = fn(&str) -> bool;

fn is_pom(name: &str) -> bool {
    Path::new(name).extension().is_some_and(|ext| ext == "pom")
}

fn is_docker_manifest(name: &str) -> bool {
    name == "manifest.json"
}

fn is_docker_list_manifest(name: &str) -> bool {
    name == "list.manifest.json"
}

fn is_conan_metadata(name: &str) -> bool {
    matches!(name, "conanfile.py" | "conaninfo.txt" | ".timestamp")
}

/// Ordered predicates for a package type. Empty for types with no ordering
/// constraints.
pub fn predicates_for(package_type: &PackageType) -> Vec<DelayPredicate> {
    match package_type {
        PackageType::Maven | PackageType::Gradle | PackageType::Ivy => vec![is_pom],
        PackageType::Docker => vec![is_docker_manifest, is_docker_list_manifest],
        PackageType::Conan => vec![is_conan_metadata],
        _ => Vec::new(),
    }
}

/// True if any predicate matches `name`.
pub fn should_delay(name: &str, predicates: &[DelayPredicate]) -> bool {
    predicates.iter().any(|predicate| predicate(name))
}

/// `<repo>-<epoch millis>-<n>.json`
fn delay_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+)-([0-9]{13})-([0-9]+)\.json$").expect("valid delay file pattern")
    })
}

/// Producer handle: decides and enqueues.
#[derive(Clone)]
pub struct DelayHelper {
    predicates: Arc<Vec<DelayPredicate>>,
    queue: Option<SpillQueue<FileCandidate>>,
}

impl DelayHelper {
    /// Helper that never delays anything.
    pub fn disabled() -> Self {
        Self {
            predicates: Arc::new(Vec::new()),
            queue: None,
        }
    }

    pub fn predicates(&self) -> &[DelayPredicate] {
        &self.predicates
    }

    /// Enqueue `file` if a predicate matches. Returns whether it was delayed.
    pub async fn delay_if_necessary(&self, file: &FileCandidate) -> Result<bool> {
        let Some(queue) = &self.queue else {
            return Ok(false);
        };
        if file.is_directory() || !should_delay(&file.name, &self.predicates) {
            return Ok(false);
        }
        queue.send(file.clone()).await?;
        Ok(true)
    }

    pub fn check(&self) -> Result<()> {
        match &self.queue {
            Some(queue) => queue.check(),
            None => Ok(()),
        }
    }
}

/// Writer task behind a [`DelayHelper`].
pub struct DelayWriter {
    writer: SpillWriter<FileCandidate>,
    rx: mpsc::Receiver<FileCandidate>,
}

impl DelayWriter {
    pub async fn run(self) -> Result<Vec<PathBuf>> {
        self.writer.run(self.rx).await
    }
}

/// Helper and writer for `repo`. Returns `None` for the writer when there are
/// no predicates left.
pub fn delay_channel(
    paths: &RepoPaths,
    repo: &str,
    predicates: Vec<DelayPredicate>,
    max_entries: usize,
) -> (DelayHelper, Option<DelayWriter>) {
    if predicates.is_empty() {
        return (DelayHelper::disabled(), None);
    }
    let (queue, writer, rx) = spill::spill_channel(SpillConfig {
        dir: paths.delays_dir(),
        prefix: repo.to_string(),
        key: DELAYS_KEY,
        max_entries,
    });
    (
        DelayHelper {
            predicates: Arc::new(predicates),
            queue: Some(queue),
        },
        Some(DelayWriter { writer, rx }),
    )
}

/// Delay files currently on disk for a repository.
pub fn list_delay_files(paths: &RepoPaths) -> Result<Vec<PathBuf>> {
    spill::list_matching(&paths.delays_dir(), delay_file_pattern())
}

pub fn read_delay_file(path: &Path) -> Result<Vec<FileCandidate>> {
    spill::read_spill_file(path, DELAYS_KEY)
}

/// Keep only `left` in a delay file; an empty list deletes it.
pub fn rewrite_delay_file(path: &Path, left: &[FileCandidate]) -> Result<()> {
    spill::rewrite_spill_file(path, DELAYS_KEY, left)
}
