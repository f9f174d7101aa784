use super::app::{Application, WorkerContext};
use crate::{
    endpoint::{Endpoint, bind_shared},
    error::{Error, Result},
    pool::{ENV_ENDPOINT, ENV_WORKER_ID, WorkerId},
    protocol::{Signal, StatusMessage},
};
use axum::{Router, extract::Request};
use std::{io::BufRead, sync::Arc};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

/// Identity handed to a worker process by its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub worker: WorkerId,
    pub endpoint: Endpoint,
}

impl WorkerEnv {
    /// Reads the worker environment of this process.
    ///
    /// Returns `Ok(None)` when the process was not launched by a supervisor,
    /// which is how a binary tells its supervisor role from its worker role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerEnv`] if the variables are present but invalid.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(worker) = lookup(ENV_WORKER_ID) else {
            return Ok(None);
        };
        let worker = worker.parse::<WorkerId>().map_err(|e| Error::WorkerEnv {
            reason: format!("{ENV_WORKER_ID}={worker:?}: {e}"),
        })?;

        let endpoint = lookup(ENV_ENDPOINT).ok_or_else(|| Error::WorkerEnv {
            reason: format!("{ENV_WORKER_ID} is set but {ENV_ENDPOINT} is not"),
        })?;
        let endpoint = endpoint.parse::<Endpoint>().map_err(|e| Error::WorkerEnv {
            reason: format!("{ENV_ENDPOINT}: {e}"),
        })?;

        Ok(Some(Self { worker, endpoint }))
    }
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The supervisor sent [`Signal::Terminate`].
    Terminated,
    /// The application called [`WorkerContext::request_exit`].
    ExitRequested,
    /// The control stream closed; the supervisor is gone.
    ControlClosed,
}

/// Runs this process as a pool worker, using stdin for control and stdout for
/// status.
///
/// Binds the shared endpoint, reports `Listening` and serves `app` until the
/// worker is terminated, asks to exit or loses its supervisor. In-flight
/// requests complete before this returns.
///
/// # Errors
///
/// - [`Error::WorkerEnv`] if this process was not launched as a worker.
/// - [`Error::Bind`] if the shared endpoint cannot be bound.
/// - [`Error::Io`] if serving fails.
pub async fn run<A: Application>(app: A) -> Result<WorkerExit> {
    let env = WorkerEnv::from_env()?.ok_or_else(|| Error::WorkerEnv {
        reason: format!("{ENV_WORKER_ID} is not set"),
    })?;
    let control = stdin_lines()?;
    serve(app, env, control, tokio::io::stdout()).await
}

/// Like [`run`], with the control and status streams supplied by the caller.
///
/// # Errors
///
/// - [`Error::Bind`] if the shared endpoint cannot be bound.
/// - [`Error::Io`] if writing status or serving fails.
pub async fn run_with<A, R, W>(app: A, env: WorkerEnv, control: R, status: W) -> Result<WorkerExit>
where
    A: Application,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = control.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    serve(app, env, rx, status).await
}

/// Reads stdin on a plain thread so a pending read never holds up process
/// exit.
fn stdin_lines() -> Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("forkpool-control".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

async fn serve<A, W>(
    app: A,
    env: WorkerEnv,
    control: mpsc::UnboundedReceiver<String>,
    mut status: W,
) -> Result<WorkerExit>
where
    A: Application,
    W: AsyncWrite + Unpin,
{
    let listener = bind_shared(&env.endpoint).await?;
    let addr = listener.local_addr()?;
    let ctx = WorkerContext::new(env.worker);
    let app = Arc::new(app);

    let router = Router::new().fallback({
        let app = Arc::clone(&app);
        let ctx = ctx.clone();
        move |request: Request| {
            let app = Arc::clone(&app);
            let ctx = ctx.clone();
            async move { app.handle(request, &ctx).await }
        }
    });

    let line = StatusMessage::Listening { addr }.to_line()?;
    status.write_all(line.as_bytes()).await?;
    status.flush().await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Worker {} listening on {addr}", env.worker);

    let (exit_tx, exit_rx) = oneshot::channel();
    axum::serve(listener, router)
        .with_graceful_shutdown(watch_control(control, app, ctx, exit_tx))
        .await?;

    let exit = exit_rx.await.unwrap_or(WorkerExit::ControlClosed);

    #[cfg(feature = "tracing")]
    tracing::info!("Worker {} stopped: {exit:?}", env.worker);

    Ok(exit)
}

/// Resolves once the worker should stop accepting, reporting why on `exit`.
async fn watch_control<A: Application>(
    mut control: mpsc::UnboundedReceiver<String>,
    app: Arc<A>,
    ctx: WorkerContext,
    exit: oneshot::Sender<WorkerExit>,
) {
    let reason = loop {
        tokio::select! {
            () = ctx.exited() => break WorkerExit::ExitRequested,
            line = control.recv() => {
                let Some(line) = line else {
                    break WorkerExit::ControlClosed;
                };
                match Signal::from_line(&line) {
                    Ok(Signal::Terminate) => break WorkerExit::Terminated,
                    Ok(Signal::Custom { payload }) => app.on_signal(payload, &ctx),
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("Ignoring non-protocol control line: {_e}");
                    }
                }
            }
        }
    };

    ctx.request_exit();
    let _ = exit.send(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::{IntoResponse, Response};
    use core::time::Duration;
    use std::{collections::HashMap, net::SocketAddr, sync::Mutex};
    use tokio::{
        io::{AsyncReadExt, BufReader, DuplexStream, duplex},
        net::TcpStream,
        sync::Notify,
        task::JoinHandle,
        time::Instant,
    };

    #[derive(Default)]
    struct TestApp {
        payloads: Arc<Mutex<Vec<serde_json::Value>>>,
        slow_started: Arc<Notify>,
    }

    impl Application for TestApp {
        async fn handle(&self, request: Request, ctx: &WorkerContext) -> Response {
            match request.uri().path() {
                "/kill" => {
                    ctx.request_exit();
                    return "bye".into_response();
                }
                "/slow" => {
                    self.slow_started.notify_one();
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    return "done".into_response();
                }
                _ => {}
            }
            format!("worker {} saw {}", ctx.worker_id(), request.uri().path()).into_response()
        }

        fn on_signal(&self, payload: serde_json::Value, _ctx: &WorkerContext) {
            self.payloads.lock().unwrap().push(payload);
        }
    }

    struct Running {
        control: DuplexStream,
        addr: SocketAddr,
        task: JoinHandle<Result<WorkerExit>>,
    }

    async fn start(app: TestApp) -> Running {
        let (control, control_rx) = duplex(1024);
        let (status_tx, status_rx) = duplex(1024);
        let env = WorkerEnv {
            worker: WorkerId::new(3),
            endpoint: Endpoint::new("127.0.0.1", 0),
        };
        let task = tokio::spawn(run_with(app, env, BufReader::new(control_rx), status_tx));

        let mut status = BufReader::new(status_rx).lines();
        let line = status.next_line().await.unwrap().unwrap();
        let StatusMessage::Listening { addr } = StatusMessage::from_line(&line).unwrap();
        Running {
            control,
            addr,
            task,
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn detects_worker_environment() {
        let vars = HashMap::from([
            (ENV_WORKER_ID, "12".to_string()),
            (ENV_ENDPOINT, "127.0.0.1:4000".to_string()),
        ]);
        let env = WorkerEnv::from_lookup(|key| vars.get(key).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(env.worker, WorkerId::new(12));
        assert_eq!(env.endpoint, Endpoint::new("127.0.0.1", 4000));
    }

    #[test]
    fn no_worker_id_means_supervisor() {
        let env = WorkerEnv::from_lookup(|_| None).unwrap();
        assert!(env.is_none());
    }

    #[test]
    fn rejects_broken_worker_environment() {
        let bad_id = HashMap::from([
            (ENV_WORKER_ID, "seven".to_string()),
            (ENV_ENDPOINT, "127.0.0.1:4000".to_string()),
        ]);
        let missing_endpoint = HashMap::from([(ENV_WORKER_ID, "7".to_string())]);

        for vars in [bad_id, missing_endpoint] {
            let result = WorkerEnv::from_lookup(|key| vars.get(key).cloned());
            assert!(matches!(result, Err(Error::WorkerEnv { .. })));
        }
    }

    #[tokio::test]
    async fn serves_until_terminated() {
        let mut worker = start(TestApp::default()).await;

        let response = get(worker.addr, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("worker 3 saw /hello"), "{response}");

        let line = Signal::Terminate.to_line().unwrap();
        worker.control.write_all(line.as_bytes()).await.unwrap();
        let exit = worker.task.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::Terminated);
    }

    #[tokio::test]
    async fn terminate_lets_in_flight_request_finish() {
        let app = TestApp::default();
        let slow_started = Arc::clone(&app.slow_started);
        let mut worker = start(app).await;

        let addr = worker.addr;
        let started = Instant::now();
        let request = tokio::spawn(async move { get(addr, "/slow").await });
        slow_started.notified().await;

        let line = Signal::Terminate.to_line().unwrap();
        worker.control.write_all(line.as_bytes()).await.unwrap();

        let response = request.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("done"), "{response}");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(worker.task.await.unwrap().unwrap(), WorkerExit::Terminated);
    }

    #[tokio::test]
    async fn custom_signals_reach_the_application() {
        let app = TestApp::default();
        let payloads = Arc::clone(&app.payloads);
        let mut worker = start(app).await;

        let reload = Signal::custom("reload").to_line().unwrap();
        let terminate = Signal::Terminate.to_line().unwrap();
        for line in [reload.as_str(), "not json\n", terminate.as_str()] {
            worker.control.write_all(line.as_bytes()).await.unwrap();
        }

        assert_eq!(worker.task.await.unwrap().unwrap(), WorkerExit::Terminated);
        assert_eq!(*payloads.lock().unwrap(), [serde_json::json!("reload")]);
    }

    #[tokio::test]
    async fn application_can_request_exit() {
        let worker = start(TestApp::default()).await;

        let response = get(worker.addr, "/kill").await;
        assert!(response.ends_with("bye"), "{response}");

        let exit = worker.task.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::ExitRequested);
    }

    #[tokio::test]
    async fn exits_when_supervisor_goes_away() {
        let worker = start(TestApp::default()).await;
        drop(worker.control);

        let exit = worker.task.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::ControlClosed);
    }

    #[tokio::test]
    async fn reports_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let env = WorkerEnv {
            worker: WorkerId::new(1),
            endpoint: Endpoint::from(taken.local_addr().unwrap()),
        };
        let (_control, control_rx) = duplex(64);

        let result = run_with(
            TestApp::default(),
            env,
            BufReader::new(control_rx),
            tokio::io::sink(),
        )
        .await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }
}
