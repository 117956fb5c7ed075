//! Rotating JSON spillover files.
//!
//! Many producers hand entries to one writer task through a bounded queue. The
//! writer groups entries into files of at most `max_entries` and writes each
//! file as `{"<key>": [..]}`. A failed write is recorded in a sticky error that
//! every producer sees on its next send.

use crate::error::{Result, TransferError};
use crate::state::manager::write_atomic;
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue capacity between producers and a writer task
pub const WRITER_CHANNEL_SIZE: usize = 500_000;

/// Default number of entries per spillover file
pub const DEFAULT_MAX_ENTRIES_PER_FILE: usize = 50_000;

/// Error recorded by a writer task, visible to all producers.
#[derive(Debug, Clone, Default)]
pub struct StickyError(Arc<Mutex<Option<String>>>);

impl StickyError {
    pub fn set(&self, message: String) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.0.lock().as_ref() {
            Some(message) => Err(TransferError::Writer(message.clone())),
            None => Ok(()),
        }
    }
}

/// Producer side of a spillover queue.
#[derive(Debug)]
pub struct SpillQueue<T> {
    tx: mpsc::Sender<T>,
    error: StickyError,
}

impl<T> Clone for SpillQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T: Send + 'static> SpillQueue<T> {
    pub async fn send(&self, entry: T) -> Result<()> {
        self.error.check()?;
        self.tx
            .send(entry)
            .await
            .map_err(|_| TransferError::Writer("spillover writer is closed".to_string()))
    }

    pub fn check(&self) -> Result<()> {
        self.error.check()
    }
}

/// Writer configuration
pub struct SpillConfig {
    /// Directory receiving the files
    pub dir: PathBuf,
    /// File name prefix; files are `<prefix>-<epoch millis>-<n>.json`
    pub prefix: String,
    /// Top-level JSON key holding the entries
    pub key: &'static str,
    pub max_entries: usize,
}

/// Consumer side: the single task that owns the files.
pub struct SpillWriter<T> {
    config: SpillConfig,
    error: StickyError,
    buffer: Vec<T>,
    written: Vec<PathBuf>,
}

/// Create a queue and the writer draining it.
pub fn spill_channel<T>(config: SpillConfig) -> (SpillQueue<T>, SpillWriter<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(WRITER_CHANNEL_SIZE);
    let error = StickyError::default();
    let writer = SpillWriter {
        config,
        error: error.clone(),
        buffer: Vec::new(),
        written: Vec::new(),
    };
    (SpillQueue { tx, error }, writer, rx)
}

impl<T: Serialize + Send + 'static> SpillWriter<T> {
    /// Drain `rx` until every producer is dropped. Returns the files written.
    pub async fn run(mut self, mut rx: mpsc::Receiver<T>) -> Result<Vec<PathBuf>> {
        while let Some(entry) = rx.recv().await {
            self.buffer.push(entry);
            if self.buffer.len() >= self.config.max_entries.max(1) {
                if let Err(e) = self.flush() {
                    self.error.set(e.to_string());
                    rx.close();
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.flush() {
            self.error.set(e.to_string());
            return Err(e);
        }
        Ok(self.written)
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.config.dir)?;
        let path = unique_path(&self.config.dir, &self.config.prefix);
        let body = encode_body(self.config.key, &self.buffer)?;
        fs::write(&path, body).map_err(|source| {
            TransferError::WriteFile {
                path: path.clone(),
                source,
            }
        })?;
        tracing::debug!(
            "Wrote {} entries to {}",
            self.buffer.len(),
            path.display()
        );
        self.buffer.clear();
        self.written.push(path);
        Ok(())
    }
}

fn encode_body<T: Serialize>(key: &str, entries: &[T]) -> Result<Vec<u8>> {
    let mut body = serde_json::Map::new();
    body.insert(key.to_string(), serde_json::to_value(entries)?);
    Ok(serde_json::to_vec(&body)?)
}

/// Replace the entries of an existing spillover file, removing the file when
/// none are left.
pub fn rewrite_spill_file<T: Serialize>(path: &Path, key: &str, entries: &[T]) -> Result<()> {
    if entries.is_empty() {
        if path.exists() {
            fs::remove_file(path)?;
        }
        return Ok(());
    }
    write_atomic(path, &encode_body(key, entries)?)
}

/// First free `<prefix>-<epoch millis>-<n>.json` in `dir`.
pub fn unique_path(dir: &Path, prefix: &str) -> PathBuf {
    let millis = Utc::now().timestamp_millis();
    let mut index = 0;
    loop {
        let path = dir.join(format!("{prefix}-{millis}-{index}.json"));
        if !path.exists() {
            return path;
        }
        index += 1;
    }
}

/// Read the entries of a spillover file.
pub fn read_spill_file<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Vec<T>> {
    let text = fs::read_to_string(path).map_err(|source| TransferError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut body: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)?;
    match body.remove(key) {
        Some(entries) => Ok(serde_json::from_value(entries)?),
        None => Ok(Vec::new()),
    }
}

/// Files in `dir` whose names match `pattern`, sorted by name.
pub fn list_matching(dir: &Path, pattern: &regex::Regex) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && pattern.is_match(&name.to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
