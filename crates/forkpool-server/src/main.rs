#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use clap::Parser;
use forkpool::{CurrentExe, Supervisor, WorkerEnv};
use server::app::DemoApp;
use server::config::{CliArgs, ServerConfig};
use server::events::log_events;
use server::telemetry::{Role, init_telemetry};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    // The supervisor launches this same binary with the worker environment set.
    match WorkerEnv::from_env()? {
        Some(env) => run_worker(env, config).await,
        None => run_supervisor(config).await,
    }
}

async fn run_supervisor(config: ServerConfig) -> anyhow::Result<()> {
    let providers = init_telemetry(Role::Supervisor)?;
    log_startup_info(&config);

    let grace = config.pool.shutdown_grace;
    let mut supervisor = Supervisor::new(config.pool, CurrentExe::inherit_args());
    let logger = tokio::spawn(log_events(supervisor.subscribe()));

    if let Err(e) = supervisor.start().await {
        drop(supervisor);
        let _ = logger.await;
        providers.shutdown();
        return Err(e).context("failed to start the worker pool");
    }
    tracing::info!("All {} workers are listening", supervisor.pool_size());

    let handle = supervisor.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown(grace).await;
    });

    let report = supervisor.run().await;
    drop(supervisor);
    let _ = logger.await;

    if report.is_clean() {
        tracing::info!("Service shut down successfully");
    } else {
        tracing::warn!(
            "Service shut down after killing {} unresponsive workers",
            report.forced.len()
        );
    }
    providers.shutdown();
    Ok(())
}

async fn run_worker(env: WorkerEnv, config: ServerConfig) -> anyhow::Result<()> {
    let providers = init_telemetry(Role::Worker)?;
    ignore_interrupts()?;

    let exit = forkpool::worker::run(DemoApp::new(config.slow_route)).await;
    providers.shutdown();

    let exit = exit.with_context(|| format!("worker {} failed", env.worker))?;
    tracing::debug!("Worker {} exiting: {exit:?}", env.worker);
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting worker pool on {} with full config: {:#?}",
            config.pool.endpoint,
            config
        );
    } else {
        tracing::info!(
            "Starting worker pool on {} with {} workers",
            config.pool.endpoint,
            config.pool.pool_size
        );
    }
}

/// A terminal Ctrl+C reaches the whole process group. Workers leave it to the
/// supervisor, which terminates them in order.
#[cfg(unix)]
fn ignore_interrupts() -> anyhow::Result<()> {
    use signal::unix::{SignalKind, signal};

    let mut interrupts =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            tracing::debug!("Ignoring SIGINT; the supervisor drives shutdown");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_interrupts() -> anyhow::Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
