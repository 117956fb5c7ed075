use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request to {url} failed with status {status}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Files transfer is already running")]
    AlreadyRunning,

    #[error("There is no active file transfer process")]
    NotRunning,

    #[error("Graceful stop is already in progress. Please wait...")]
    StopInProgress,

    #[error("Source plugin is incompatible: {0}")]
    Incompatible(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Spillover writer failed: {0}")]
    Writer(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
