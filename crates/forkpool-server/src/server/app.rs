//! Demo application served by every worker.
//!
//! | route | response |
//! |---|---|
//! | `/` | `process: <pid>` |
//! | `/fast` | `process: <pid>` |
//! | `/slow` | `Hi there` after the configured delay |
//! | `/kill` | acknowledges, then the worker exits and is replaced |
//! | anything else | `404` |

use axum::{
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use core::time::Duration;
use forkpool::{Application, WorkerContext};

#[derive(Debug, Clone)]
pub struct DemoApp {
    slow_route: Duration,
}

impl DemoApp {
    pub const fn new(slow_route: Duration) -> Self {
        Self { slow_route }
    }
}

impl Application for DemoApp {
    async fn handle(&self, request: Request, ctx: &WorkerContext) -> Response {
        let pid = std::process::id();

        match request.uri().path() {
            "/" | "/fast" => format!("process: {pid}").into_response(),
            "/slow" => {
                tokio::time::sleep(self.slow_route).await;
                "Hi there".into_response()
            }
            "/kill" => {
                tracing::info!("Worker {} asked to exit", ctx.worker_id());
                ctx.request_exit();
                format!("process {pid} exiting").into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    fn on_signal(&self, payload: serde_json::Value, ctx: &WorkerContext) {
        tracing::info!("Worker {} received signal: {payload}", ctx.worker_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkpool::{Endpoint, Signal, WorkerEnv, WorkerExit, WorkerId, protocol::StatusMessage, worker};
    use std::net::SocketAddr;
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, duplex},
        net::TcpStream,
    };

    /// Serves a single request through a real worker runtime, then stops it.
    async fn serve_once(app: DemoApp, path: &str) -> (StatusCode, String, WorkerExit) {
        let (mut control, control_rx) = duplex(256);
        let (status_tx, status_rx) = duplex(256);
        let env = WorkerEnv {
            worker: WorkerId::new(1),
            endpoint: Endpoint::new("127.0.0.1", 0),
        };
        let task = tokio::spawn(worker::run_with(
            app,
            env,
            BufReader::new(control_rx),
            status_tx,
        ));

        let line = BufReader::new(status_rx)
            .lines()
            .next_line()
            .await
            .unwrap()
            .unwrap();
        let StatusMessage::Listening { addr } = StatusMessage::from_line(&line).unwrap();

        let response = raw_get(addr, path).await;
        if path != "/kill" {
            let terminate = Signal::Terminate.to_line().unwrap();
            control.write_all(terminate.as_bytes()).await.unwrap();
        }
        let exit = task.await.unwrap().unwrap();

        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap();
        (status, body.to_string(), exit)
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn root_reports_process_id() {
        let (status, body, _) = serve_once(DemoApp::new(Duration::ZERO), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("process: {}", std::process::id()));
    }

    #[tokio::test]
    async fn slow_route_waits_before_answering() {
        let app = DemoApp::new(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let (status, body, _) = serve_once(app, "/slow").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hi there");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn kill_route_ends_the_worker() {
        let (status, _, exit) = serve_once(DemoApp::new(Duration::ZERO), "/kill").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(exit, WorkerExit::ExitRequested);
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let (status, body, exit) = serve_once(DemoApp::new(Duration::ZERO), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
        assert_eq!(exit, WorkerExit::Terminated);
    }
}
