use crate::{
    error::{Error, Result},
    event::ExitReason,
    protocol::Signal,
};
use core::{fmt, str::FromStr};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Identity of one worker process.
///
/// Allocated by the supervisor from a counter and never reused: a replacement
/// always gets a fresh id, even when it takes over the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WorkerId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Launched, not yet bound to the shared endpoint.
    Starting,
    /// Bound and accepting connections.
    Listening,
    Exited(ExitReason),
}

/// Read-only snapshot of a [`WorkerHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub slot: usize,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub spawned_at: Instant,
}

/// One running worker process, owned by the [`Supervisor`].
///
/// A handle can deliver signals to its process but never spawns or respawns
/// one; only the supervisor decides how many workers exist. The process's
/// exit is reported once, by its monitor task, to the supervisor's loop.
///
/// [`Supervisor`]: crate::Supervisor
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    slot: usize,
    pid: Option<u32>,
    status: WorkerStatus,
    spawned_at: Instant,
    signals: mpsc::UnboundedSender<Signal>,
    kill: CancellationToken,
    stop_requested: bool,
    missed_startup: bool,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        slot: usize,
        pid: Option<u32>,
        signals: mpsc::UnboundedSender<Signal>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            id,
            slot,
            pid,
            status: WorkerStatus::Starting,
            spawned_at: Instant::now(),
            signals,
            kill,
            stop_requested: false,
            missed_startup: false,
        }
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Positional slot this worker occupies (`0..pool_size`).
    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub const fn status(&self) -> WorkerStatus {
        self.status
    }

    pub const fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            slot: self.slot,
            pid: self.pid,
            status: self.status,
            spawned_at: self.spawned_at,
        }
    }

    /// Delivers `signal` to the worker's control channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownWorker`] if the process has already exited and
    /// its monitor is gone.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.signals
            .send(signal)
            .map_err(|_| Error::UnknownWorker(self.id))
    }

    /// Kills the process. Never waits behind queued signals.
    pub(crate) fn kill(&self) {
        self.kill.cancel();
    }

    pub(crate) fn mark_listening(&mut self) {
        if self.status == WorkerStatus::Starting {
            self.status = WorkerStatus::Listening;
        }
    }

    pub(crate) fn mark_exited(&mut self, reason: ExitReason) {
        self.status = WorkerStatus::Exited(reason);
    }

    /// The supervisor asked this worker to go away; its exit is expected.
    pub(crate) fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub(crate) const fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// The worker did not report `Listening` before its startup deadline.
    pub(crate) fn mark_missed_startup(&mut self) {
        self.missed_startup = true;
    }

    pub(crate) const fn missed_startup(&self) -> bool {
        self.missed_startup
    }
}
