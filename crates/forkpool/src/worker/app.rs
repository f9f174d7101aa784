use crate::pool::WorkerId;
use axum::{extract::Request, response::Response};
use core::future::Future;
use tokio_util::sync::CancellationToken;

/// Request handling logic run inside every worker process.
///
/// The library owns the socket, the accept loop and the HTTP connection
/// handling; an application only turns requests into responses.
///
/// ```rust,no_run
/// use axum::{extract::Request, response::{IntoResponse, Response}};
/// use forkpool::{Application, WorkerContext};
///
/// struct Echo;
///
/// impl Application for Echo {
///     async fn handle(&self, request: Request, ctx: &WorkerContext) -> Response {
///         format!("{} served by worker {}", request.uri(), ctx.worker_id()).into_response()
///     }
/// }
/// ```
pub trait Application: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request,
        ctx: &WorkerContext,
    ) -> impl Future<Output = Response> + Send;

    /// Called for every [`Signal::Custom`](crate::Signal::Custom) the worker
    /// receives. Ignores the payload by default.
    fn on_signal(&self, payload: serde_json::Value, ctx: &WorkerContext) {
        let _ = (payload, ctx);
    }
}

/// Per-worker state handed to every [`Application`] call.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker: WorkerId,
    exit: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            exit: CancellationToken::new(),
        }
    }

    pub const fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Stops this worker: it stops accepting, finishes in-flight requests and
    /// exits. The supervisor sees an unrequested exit and replaces it.
    pub fn request_exit(&self) {
        self.exit.cancel();
    }

    /// The worker is shutting down, for whatever reason.
    pub fn exit_requested(&self) -> bool {
        self.exit.is_cancelled()
    }

    pub(crate) async fn exited(&self) {
        self.exit.cancelled().await;
    }
}
