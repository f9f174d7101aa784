//! Lifecycle events published by the supervisor.
//!
//! The supervisor does not log. It publishes [`PoolEvent`]s on a broadcast
//! channel and leaves formatting, logging and metrics to the subscriber.

use crate::pool::WorkerId;
use core::{fmt, time::Duration};
use std::{net::SocketAddr, process::ExitStatus};
use tokio::time::Instant;

/// How a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with a status code.
    Code(i32),
    /// Killed by a signal (Unix only).
    Signal(i32),
    /// The status could not be collected.
    Unknown,
}

impl ExitReason {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Unknown
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// A worker process has terminated.
///
/// Produced exactly once per worker. `was_requested` is set when the
/// supervisor itself asked the worker to stop (shutdown or an aborted start);
/// those exits are never replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub worker: WorkerId,
    pub reason: ExitReason,
    pub was_requested: bool,
}

/// Everything observable about the pool's lifecycle.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker process was launched into `slot`.
    WorkerSpawned {
        worker: WorkerId,
        slot: usize,
        pid: Option<u32>,
        at: Instant,
    },
    /// A worker bound the shared endpoint.
    WorkerListening { worker: WorkerId, addr: SocketAddr },
    WorkerExited(ExitEvent),
    /// `replacement` took over the slot `previous` held.
    WorkerReplaced {
        previous: WorkerId,
        replacement: WorkerId,
        slot: usize,
    },
    /// The replacement for `previous` will be launched after `delay`.
    RespawnScheduled {
        previous: WorkerId,
        slot: usize,
        delay: Duration,
    },
    /// A worker could not be launched, or a replacement missed its startup
    /// deadline and is being killed.
    SpawnFailed {
        worker: WorkerId,
        slot: usize,
        error: String,
    },
    PoolShuttingDown { workers: usize },
    /// These workers ignored the terminate signal past the grace period and
    /// are being killed.
    ShutdownTimedOut { workers: Vec<WorkerId> },
    PoolShutDown { graceful: usize, forced: usize },
}
