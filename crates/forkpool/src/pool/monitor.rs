use super::{
    factory::{ENV_ENDPOINT, ENV_WORKER_ID, WorkerFactory},
    handle::{WorkerHandle, WorkerId},
};
use crate::{
    endpoint::Endpoint,
    error::SpawnFailure,
    event::ExitReason,
    protocol::{Signal, StatusMessage},
};
use core::time::Duration;
use std::{net::SocketAddr, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// How long to keep reading stdout after the process has exited.
const STDOUT_DRAIN: Duration = Duration::from_millis(100);

/// What a monitor reports back to the supervisor loop.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Listening { worker: WorkerId, addr: SocketAddr },
    Exited { worker: WorkerId, reason: ExitReason },
}

/// Launches one worker process and its monitor task.
///
/// The returned handle starts in `Starting`. The monitor sends
/// [`WorkerEvent::Listening`] when the worker reports a bind, and exactly one
/// [`WorkerEvent::Exited`] when the process is gone.
pub(crate) fn launch(
    factory: &dyn WorkerFactory,
    worker: WorkerId,
    slot: usize,
    endpoint: &Endpoint,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerHandle, SpawnFailure> {
    let launch_err = |e: std::io::Error| SpawnFailure::Launch(e.to_string());

    let mut command = factory.command(worker).map_err(launch_err)?;
    command
        .env(ENV_WORKER_ID, worker.to_string())
        .env(ENV_ENDPOINT, endpoint.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(launch_err)?;
    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnFailure::Launch("worker stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpawnFailure::Launch("worker stdout not captured".into()))?;

    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let writer = tokio::spawn(write_signals(worker, stdin, signals_rx));
    tokio::spawn(monitor(worker, child, stdout, kill.clone(), writer, events));

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker} launched in slot {slot} (pid {pid:?})");

    Ok(WorkerHandle::new(worker, slot, pid, signals_tx, kill))
}

/// Owns the child process until it exits.
///
/// Turns status lines from its stdout into events and kills it once `kill`
/// is cancelled. Signals are written by a separate task, so a worker that
/// stops reading its stdin can still be killed.
async fn monitor(
    worker: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    kill: CancellationToken,
    writer: tokio::task::JoinHandle<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;
    let mut killed = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,

            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => forward_status(worker, &line, &events),
                Ok(None) | Err(_) => stdout_open = false,
            },

            () = kill.cancelled(), if !killed => {
                killed = true;
                if let Err(_e) = child.start_kill() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Failed to kill worker {worker}: {_e}");
                }
            }
        }
    };
    // A write stuck on a full pipe must not outlive the process.
    writer.abort();

    // A status line written right before exiting still counts.
    if stdout_open {
        let drain = async {
            while let Ok(Some(line)) = lines.next_line().await {
                forward_status(worker, &line, &events);
            }
        };
        let _ = timeout(STDOUT_DRAIN, drain).await;
    }

    let reason = match status {
        Ok(status) => ExitReason::from(status),
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to collect exit status of worker {worker}: {_e}");
            ExitReason::Unknown
        }
    };

    let _ = events.send(WorkerEvent::Exited { worker, reason });
}

/// Writes queued signals to the worker's stdin, one line each, until the
/// handle goes away or the monitor aborts the task.
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
async fn write_signals(
    worker: WorkerId,
    mut stdin: ChildStdin,
    mut signals: mpsc::UnboundedReceiver<Signal>,
) {
    while let Some(signal) = signals.recv().await {
        let written = match signal.to_line() {
            Ok(line) => stdin.write_all(line.as_bytes()).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(_e) = written {
            #[cfg(feature = "tracing")]
            tracing::debug!("Failed to signal worker {worker}: {_e}");
        }
    }
}

fn forward_status(worker: WorkerId, line: &str, events: &mpsc::UnboundedSender<WorkerEvent>) {
    match StatusMessage::from_line(line) {
        Ok(StatusMessage::Listening { addr }) => {
            let _ = events.send(WorkerEvent::Listening { worker, addr });
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::trace!("Worker {worker} wrote a non-protocol line: {_e}");
        }
    }
}
