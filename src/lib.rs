//! repo-transfer - resumable bulk migration of repositories between artifact
//! servers.
//!
//! The source instance runs a data-transfer plugin; this crate drives it,
//! chunk by chunk, and keeps enough state on disk to resume after a crash or a
//! graceful stop.

pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod transfer;

pub use api::client::ArtifactoryClient;
pub use api::{SourceApi, TargetApi};
pub use config::{ThreadSettings, Timings, TransferConfig};
pub use error::{Result, TransferError};
pub use transfer::{request_stop, StopSignal, TransferCoordinator};
