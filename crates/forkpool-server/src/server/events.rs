use super::telemetry;
use forkpool::{ExitEvent, PoolEvent, WorkerId};
use std::collections::HashMap;
use tokio::{sync::broadcast, time::Instant};

/// Logs every pool event and feeds the lifecycle metrics until the pool has
/// shut down or the supervisor is gone.
pub async fn log_events(mut events: broadcast::Receiver<PoolEvent>) {
    let mut spawned_at: HashMap<WorkerId, Instant> = HashMap::new();

    loop {
        match events.recv().await {
            Ok(event) => {
                let done = matches!(event, PoolEvent::PoolShutDown { .. });
                record(&event, &mut spawned_at);
                if done {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log fell behind; {skipped} pool events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn record(event: &PoolEvent, spawned_at: &mut HashMap<WorkerId, Instant>) {
    match event {
        PoolEvent::WorkerSpawned {
            worker,
            slot,
            pid,
            at,
        } => {
            spawned_at.insert(*worker, *at);
            telemetry::increment_workers_spawned();
            match pid {
                Some(pid) => tracing::info!("Worker {worker} spawned in slot {slot} (pid {pid})"),
                None => tracing::info!("Worker {worker} spawned in slot {slot}"),
            }
        }
        PoolEvent::WorkerListening { worker, addr } => {
            tracing::debug!("Worker {worker} listening on {addr}");
        }
        PoolEvent::WorkerExited(ExitEvent {
            worker,
            reason,
            was_requested,
        }) => {
            let lifetime = spawned_at.remove(worker).map(|at| at.elapsed());
            telemetry::record_worker_exit(
                *was_requested,
                lifetime.map(|lifetime| lifetime.as_secs_f64() * 1_000.0),
            );
            if *was_requested {
                tracing::info!("Worker {worker} stopped ({reason})");
            } else {
                tracing::warn!("Worker {worker} died ({reason}) after {lifetime:?}");
            }
        }
        PoolEvent::WorkerReplaced {
            previous,
            replacement,
            slot,
        } => {
            tracing::info!("Worker {replacement} replaced worker {previous} in slot {slot}");
        }
        PoolEvent::RespawnScheduled {
            previous,
            slot,
            delay,
        } => {
            tracing::warn!("Slot {slot} keeps failing; replacing worker {previous} in {delay:?}");
        }
        PoolEvent::SpawnFailed {
            worker,
            slot,
            error,
        } => {
            telemetry::increment_spawn_failures();
            tracing::error!("Worker {worker} in slot {slot} failed to start: {error}");
        }
        PoolEvent::PoolShuttingDown { workers } => {
            tracing::info!("Shutting down {workers} workers");
        }
        PoolEvent::ShutdownTimedOut { workers } => {
            tracing::warn!("Workers {workers:?} ignored terminate past the grace period; killing");
        }
        PoolEvent::PoolShutDown { graceful, forced } => {
            tracing::info!("Pool shut down: {graceful} graceful, {forced} forced");
        }
    }
}
