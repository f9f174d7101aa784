//! Fixed-size process pool supervisor.
//!
//! This module defines [`Supervisor`], which launches `pool_size` worker
//! processes, keeps that many alive by replacing every worker that exits on
//! its own, and shuts the pool down with a grace period.
//!
//! All pool state is owned by the supervisor and mutated only from its own
//! control loop. Monitor tasks report worker events over a channel; timers
//! (respawn backoff, startup deadlines) live in a [`DelayQueue`]; other tasks
//! talk to the loop through a [`SupervisorHandle`]. Events are handled one at
//! a time, so two replacements never race on the pool bookkeeping.

use super::{
    factory::WorkerFactory,
    handle::{WorkerHandle, WorkerId, WorkerInfo, WorkerStatus},
    monitor::{self, WorkerEvent},
};
use crate::{
    config::PoolConfig,
    error::{Error, Result, SpawnFailure},
    event::{ExitEvent, ExitReason, PoolEvent},
    protocol::Signal,
};
use core::{future::poll_fn, time::Duration};
use std::{
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, timeout_at},
};
use tokio_util::time::DelayQueue;

/// Capacity of the [`PoolEvent`] broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Capacity of the [`SupervisorHandle`] command channel.
const COMMAND_CAPACITY: usize = 32;

/// Upper bound on waiting for killed workers to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest retry after a replacement could not be launched.
const RETRY_FLOOR: Duration = Duration::from_millis(10);

/// Outcome of [`Supervisor::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that exited on their own within the grace period.
    pub graceful: usize,
    /// Workers that ignored the terminate signal and were killed.
    pub forced: Vec<WorkerId>,
}

impl ShutdownReport {
    /// No worker had to be killed.
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug)]
enum Timer {
    Respawn { slot: usize, previous: WorkerId },
    StartupDeadline(WorkerId),
}

#[derive(Debug)]
enum Command {
    Shutdown { grace: Duration },
    Signal {
        worker: WorkerId,
        signal: Signal,
        reply: oneshot::Sender<Result<()>>,
    },
    Workers { reply: oneshot::Sender<Vec<WorkerInfo>> },
}

/// Restart bookkeeping for one positional slot.
#[derive(Debug, Default)]
struct Slot {
    failures: u32,
}

/// Keeps `pool_size` worker processes alive.
///
/// ```text
/// new ──start()──▶ running ──run()── exit? replace ──▶ ... ──shutdown()──▶ stopped
/// ```
///
/// - [`start`](Self::start) launches the initial pool and waits until every
///   worker is listening. On failure nothing is left running.
/// - [`run`](Self::run) blocks on the next worker event, timer or command
///   and replaces workers that exit unrequested.
/// - [`shutdown`](Self::shutdown) terminates the pool with a grace period.
pub struct Supervisor {
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    phase: Phase,
    pool: BTreeMap<WorkerId, WorkerHandle>,
    slots: Vec<Slot>,
    next_id: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    backlog: VecDeque<WorkerEvent>,
    timers: DelayQueue<Timer>,
    observers: broadcast::Sender<PoolEvent>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    report: watch::Sender<Option<ShutdownReport>>,
}

impl Supervisor {
    /// Creates an idle supervisor. Nothing is launched until
    /// [`start`](Self::start).
    pub fn new(config: PoolConfig, factory: impl WorkerFactory) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (observers, _) = broadcast::channel(EVENT_CAPACITY);
        let (report, _) = watch::channel(None);
        let slots = (0..config.pool_size).map(|_| Slot::default()).collect();

        Self {
            config,
            factory: Arc::new(factory),
            phase: Phase::Idle,
            pool: BTreeMap::new(),
            slots,
            next_id: 0,
            events_tx,
            events_rx,
            backlog: VecDeque::new(),
            timers: DelayQueue::new(),
            observers,
            commands_tx,
            commands_rx,
            report,
        }
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribes to lifecycle events. Subscribe before [`start`](Self::start)
    /// to see the initial spawns.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.observers.subscribe()
    }

    /// A cloneable handle for talking to the control loop from other tasks.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.commands_tx.clone(),
            observers: self.observers.clone(),
            report: self.report.subscribe(),
        }
    }

    /// Number of live workers.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub const fn target_size(&self) -> usize {
        self.config.pool_size
    }

    /// Snapshot of the pool, ordered by worker id.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.values().map(WorkerHandle::info).collect()
    }

    /// Delivers `signal` to one worker.
    ///
    /// A [`Signal::Terminate`] sent this way is a rolling restart: the worker
    /// exits unrequested and is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownWorker`] if `worker` is not in the pool.
    pub fn signal(&self, worker: WorkerId, signal: Signal) -> Result<()> {
        self.pool
            .get(&worker)
            .ok_or(Error::UnknownWorker(worker))?
            .signal(signal)
    }

    /// Launches the initial pool and waits until every worker is listening.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if called more than once.
    /// - [`Error::InvalidConfig`] if the configuration is unusable.
    /// - [`Error::Spawn`] if any worker cannot be launched, exits before it is
    ///   listening, or is not listening within `startup_timeout`. Every worker
    ///   launched so far is killed and reaped before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::AlreadyStarted);
        }
        self.config.validate()?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Starting {} workers on {}",
            self.config.pool_size,
            self.config.endpoint
        );

        for slot in 0..self.config.pool_size {
            if let Err(e) = self.launch(slot, None) {
                self.abort_start().await;
                return Err(e);
            }
        }

        let deadline = Instant::now() + self.config.startup_timeout;
        while let Some(pending) = self.first_starting() {
            let event = match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => {
                    self.abort_start().await;
                    return Err(Error::Spawn {
                        worker: pending,
                        reason: SpawnFailure::StartupTimeout(self.config.startup_timeout),
                    });
                }
            };

            match event {
                WorkerEvent::Listening { worker, addr } => self.on_listening(worker, addr),
                WorkerEvent::Exited { worker, reason } => {
                    let listened = self
                        .pool
                        .get(&worker)
                        .is_some_and(|h| h.status() == WorkerStatus::Listening);
                    if listened {
                        // It made it; `run` replaces it like any other exit.
                        self.backlog
                            .push_back(WorkerEvent::Exited { worker, reason });
                        continue;
                    }
                    self.on_exit(worker, reason);
                    self.abort_start().await;
                    return Err(Error::Spawn {
                        worker,
                        reason: SpawnFailure::ExitedBeforeListening(reason),
                    });
                }
            }
        }

        self.phase = Phase::Running;
        Ok(())
    }

    /// Runs the control loop until a shutdown is requested through a
    /// [`SupervisorHandle`], then returns the shutdown report.
    ///
    /// Every unrequested exit of a pool member removes it and schedules one
    /// replacement in the same slot, immediately or after the slot's backoff
    /// delay. Replacement failures are published as events and retried; they
    /// never end the loop.
    ///
    /// Returns immediately if the pool is not running.
    pub async fn run(&mut self) -> ShutdownReport {
        if self.phase != Phase::Running {
            return self.report.borrow().clone().unwrap_or_default();
        }

        while let Some(event) = self.backlog.pop_front() {
            self.on_worker_event(event);
        }

        loop {
            let has_timers = !self.timers.is_empty();
            tokio::select! {
                Some(command) = self.commands_rx.recv() => match command {
                    Command::Shutdown { grace } => return self.shutdown(grace).await,
                    Command::Signal { worker, signal, reply } => {
                        let _ = reply.send(self.signal(worker, signal));
                    }
                    Command::Workers { reply } => {
                        let _ = reply.send(self.workers());
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_worker_event(event),
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)), if has_timers => {
                    self.on_timer(expired.into_inner());
                }
            }
        }
    }

    /// Terminates every worker, waiting up to `grace` before killing the ones
    /// still running.
    ///
    /// Workers that ignore the terminate signal past `grace` are reported in
    /// a [`PoolEvent::ShutdownTimedOut`] warning and in
    /// [`ShutdownReport::forced`]; shutdown itself always completes.
    /// Idempotent: later calls return the first report.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        if let Some(report) = self.report.borrow().clone() {
            return report;
        }

        self.phase = Phase::ShuttingDown;
        // Exits that happened before the shutdown are crashes, not stops.
        self.drain_pending();
        self.timers.clear();
        let total = self.pool.len();
        self.emit(PoolEvent::PoolShuttingDown { workers: total });

        #[cfg(feature = "tracing")]
        tracing::debug!("Terminating {total} workers with {grace:?} grace");

        for handle in self.pool.values_mut() {
            handle.request_stop();
            if let Err(_e) = handle.signal(Signal::Terminate) {
                #[cfg(feature = "tracing")]
                tracing::debug!("Failed to send terminate to worker {}: {_e}", handle.id());
            }
        }

        self.reap_until(Instant::now() + grace).await;

        let forced: Vec<WorkerId> = self.pool.keys().copied().collect();
        if !forced.is_empty() {
            self.emit(PoolEvent::ShutdownTimedOut {
                workers: forced.clone(),
            });
            for handle in self.pool.values() {
                handle.kill();
            }
            self.reap_until(Instant::now() + KILL_REAP_TIMEOUT).await;
            for _handle in std::mem::take(&mut self.pool).values() {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Worker {} (pid {:?}) was killed but not reaped within {KILL_REAP_TIMEOUT:?}",
                    _handle.id(),
                    _handle.pid()
                );
            }
        }

        let report = ShutdownReport {
            graceful: total - forced.len(),
            forced,
        };
        self.phase = Phase::Stopped;
        self.emit(PoolEvent::PoolShutDown {
            graceful: report.graceful,
            forced: report.forced.len(),
        });
        self.report.send_replace(Some(report.clone()));
        report
    }

    fn allocate_id(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId::new(self.next_id)
    }

    fn first_starting(&self) -> Option<WorkerId> {
        self.pool
            .values()
            .find(|h| h.status() == WorkerStatus::Starting)
            .map(WorkerHandle::id)
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.observers.send(event);
    }

    /// Launches a worker into `slot` and adds it to the pool.
    fn launch(&mut self, slot: usize, previous: Option<WorkerId>) -> Result<WorkerId> {
        let worker = self.allocate_id();
        let handle = monitor::launch(
            self.factory.as_ref(),
            worker,
            slot,
            &self.config.endpoint,
            self.events_tx.clone(),
        )
        .map_err(|reason| Error::Spawn { worker, reason })?;

        self.emit(PoolEvent::WorkerSpawned {
            worker,
            slot,
            pid: handle.pid(),
            at: handle.spawned_at(),
        });
        if let Some(previous) = previous {
            self.emit(PoolEvent::WorkerReplaced {
                previous,
                replacement: worker,
                slot,
            });
        }

        self.pool.insert(worker, handle);
        Ok(worker)
    }

    /// Launches the replacement for `previous`, retrying with backoff if the
    /// process cannot be created.
    fn respawn(&mut self, slot: usize, previous: WorkerId) {
        match self.launch(slot, Some(previous)) {
            Ok(worker) => {
                self.timers.insert(
                    Timer::StartupDeadline(worker),
                    self.config.startup_timeout,
                );
            }
            Err(e) => {
                let worker = match &e {
                    Error::Spawn { worker, .. } => *worker,
                    _ => previous,
                };
                self.emit(PoolEvent::SpawnFailed {
                    worker,
                    slot,
                    error: e.to_string(),
                });

                let backoff = self.config.backoff;
                let state = &mut self.slots[slot];
                let delay = backoff.delay(state.failures).max(backoff.initial).max(RETRY_FLOOR);
                state.failures = state.failures.saturating_add(1);
                self.schedule_respawn(slot, previous, delay);
            }
        }
    }

    fn schedule_respawn(&mut self, slot: usize, previous: WorkerId, delay: Duration) {
        if delay.is_zero() {
            self.respawn(slot, previous);
            return;
        }
        self.emit(PoolEvent::RespawnScheduled {
            previous,
            slot,
            delay,
        });
        self.timers.insert(Timer::Respawn { slot, previous }, delay);
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Listening { worker, addr } => self.on_listening(worker, addr),
            WorkerEvent::Exited { worker, reason } => self.on_exit(worker, reason),
        }
    }

    fn on_listening(&mut self, worker: WorkerId, addr: SocketAddr) {
        if let Some(handle) = self.pool.get_mut(&worker) {
            handle.mark_listening();
            self.emit(PoolEvent::WorkerListening { worker, addr });
        }
    }

    /// Removes an exited worker and, if its exit was not requested while the
    /// pool is running, schedules its replacement.
    fn on_exit(&mut self, worker: WorkerId, reason: ExitReason) {
        // Exits of workers that already left the pool are stale.
        let Some(mut handle) = self.pool.remove(&worker) else {
            return;
        };
        handle.mark_exited(reason);

        let was_requested = handle.stop_requested();
        self.emit(PoolEvent::WorkerExited(ExitEvent {
            worker,
            reason,
            was_requested,
        }));

        if was_requested || self.phase != Phase::Running {
            return;
        }

        let backoff = self.config.backoff;
        let slot = handle.slot();
        let state = &mut self.slots[slot];
        if handle.spawned_at().elapsed() >= backoff.stable_after && !handle.missed_startup() {
            state.failures = 0;
        }
        let delay = backoff.delay(state.failures);
        state.failures = state.failures.saturating_add(1);

        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {worker} in slot {slot} exited ({reason}); replacing in {delay:?}");

        self.schedule_respawn(slot, worker, delay);
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Respawn { slot, previous } => {
                if self.phase == Phase::Running {
                    self.respawn(slot, previous);
                }
            }
            Timer::StartupDeadline(worker) => {
                let Some(handle) = self.pool.get_mut(&worker) else {
                    return;
                };
                if handle.status() != WorkerStatus::Starting {
                    return;
                }
                handle.mark_missed_startup();
                handle.kill();
                let slot = handle.slot();
                self.emit(PoolEvent::SpawnFailed {
                    worker,
                    slot,
                    error: SpawnFailure::StartupTimeout(self.config.startup_timeout).to_string(),
                });
            }
        }
    }

    /// Kills everything launched by a failed [`start`](Self::start).
    async fn abort_start(&mut self) {
        for handle in self.pool.values_mut() {
            handle.request_stop();
            handle.kill();
        }
        self.reap_until(Instant::now() + KILL_REAP_TIMEOUT).await;
        self.pool.clear();
        self.phase = Phase::Stopped;
        self.report.send_replace(Some(ShutdownReport::default()));
    }

    /// Handles every worker event that is already queued.
    fn drain_pending(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            self.on_worker_event(event);
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_worker_event(event);
        }
    }

    /// Handles worker events until the pool is empty or `deadline` passes.
    async fn reap_until(&mut self, deadline: Instant) {
        while let Some(event) = self.backlog.pop_front() {
            self.on_worker_event(event);
        }
        while !self.pool.is_empty() {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.on_worker_event(event),
                Ok(None) | Err(_) => return,
            }
        }
    }
}

/// Talks to a [`Supervisor`] whose [`run`](Supervisor::run) loop is active.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    observers: broadcast::Sender<PoolEvent>,
    report: watch::Receiver<Option<ShutdownReport>>,
}

impl SupervisorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.observers.subscribe()
    }

    /// Asks the control loop to shut the pool down and waits until it is down.
    ///
    /// Safe to call repeatedly and from several tasks: every call returns the
    /// report of the one shutdown that happened.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut report = self.report.clone();
        if report.borrow().is_none() {
            // A closed channel means the supervisor is gone; the watch below
            // then resolves too.
            let _ = self.commands.send(Command::Shutdown { grace }).await;
        }
        match report.wait_for(Option::is_some).await {
            Ok(report) => report.clone().unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        }
    }

    /// Delivers `signal` to one worker.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownWorker`] if `worker` is not in the pool.
    /// - [`Error::NotRunning`] if the control loop is not running.
    pub async fn signal(&self, worker: WorkerId, signal: Signal) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Signal {
            worker,
            signal,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::NotRunning)?
    }

    /// Snapshot of the pool, ordered by worker id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] if the control loop is not running.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Workers { reply }).await?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    async fn request(&self, command: Command) -> Result<()> {
        if self.report.borrow().is_some() {
            return Err(Error::NotRunning);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::NotRunning)
    }
}
