//! Error types for the worker pool.
//!
//! ## Error Cases
//! - `Spawn`: a worker could not be launched, exited before it was listening,
//!   or missed the startup deadline. Fatal during [`Supervisor::start`],
//!   retried with backoff once the pool is running.
//! - `Bind`: a worker could not bind the shared endpoint.
//! - `InvalidEndpoint` / `InvalidConfig`: rejected input.
//! - `UnknownWorker`: a signal addressed a worker that is not in the pool.
//! - `NotRunning` / `AlreadyStarted`: lifecycle misuse.
//! - `WorkerEnv`: the worker-side environment is malformed.
//! - `Protocol` / `Io`: control channel failures.
//!
//! [`Supervisor::start`]: crate::Supervisor::start

use crate::{endpoint::Endpoint, event::ExitReason, pool::WorkerId};
use core::time::Duration;
use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the worker pool.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A worker failed to start.
    #[error("worker {worker} failed to start: {reason}")]
    Spawn {
        worker: WorkerId,
        reason: SpawnFailure,
    },

    /// The shared endpoint could not be bound.
    #[error("failed to bind shared endpoint {endpoint}: {source}")]
    Bind { endpoint: Endpoint, source: io::Error },

    /// The endpoint string is not `host:port`.
    #[error("invalid endpoint `{input}`: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    /// The pool configuration is unusable.
    #[error("invalid pool configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The worker is not (or no longer) part of the pool.
    #[error("worker {0} is not part of the pool")]
    UnknownWorker(WorkerId),

    /// The supervisor control loop is not running.
    #[error("supervisor is not running")]
    NotRunning,

    /// [`Supervisor::start`](crate::Supervisor::start) was called twice.
    #[error("supervisor was already started")]
    AlreadyStarted,

    /// The worker environment set by the supervisor is malformed.
    #[error("invalid worker environment: {reason}")]
    WorkerEnv { reason: String },

    /// A control or status line could not be encoded or decoded.
    #[error("control protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a worker did not make it to `Listening`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The process could not be created.
    #[error("could not launch process: {0}")]
    Launch(String),

    /// The process terminated before reporting a successful bind.
    #[error("exited before listening ({0})")]
    ExitedBeforeListening(ExitReason),

    /// The process did not report a successful bind in time.
    #[error("did not start listening within {0:?}")]
    StartupTimeout(Duration),
}
