//! Transfer engine.
//!
//! [`coordinator::TransferCoordinator`] drives a run repository by repository.
//! Each repository goes through the phases in [`phase`]; each phase runs one or
//! more passes through [`manager::run_transfer`], which wires the worker pools
//! of [`pipeline`] to the uploader and poller of [`polling`].

pub mod chunk;
pub mod coordinator;
pub mod delayed;
pub mod errors;
pub mod manager;
pub mod phase;
pub mod pipeline;
pub mod polling;
pub mod snapshot;
pub mod spill;
pub mod status;

pub use coordinator::{request_stop, TransferCoordinator};
pub use pipeline::{Clock, ManualClock, StopSignal, SystemClock};
