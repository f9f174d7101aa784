#![cfg(unix)]

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

const BIN: &str = env!("CARGO_BIN_EXE_forkpool-server");

struct Server {
    pid: u32,
    child: Option<Child>,
    logs: mpsc::Receiver<String>,
}

impl Server {
    fn start(endpoint: &str, extra: &[&str]) -> Self {
        let mut child = Command::new(BIN)
            .args(["--pool-size", "2", "--endpoint", endpoint])
            .args(extra)
            .env("RUST_LOG", "info")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start forkpool-server");

        let stderr = child.stderr.take().unwrap();
        let (tx, logs) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            pid: child.id(),
            child: Some(child),
            logs,
        }
    }

    fn wait_for_log(&self, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.logs.recv_timeout(remaining) {
                Ok(line) if line.contains(needle) => return line,
                Ok(_) => {}
                Err(_) => panic!("no log line containing {needle:?} within {timeout:?}"),
            }
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> ExitStatus {
        let mut child = self.child.take().expect("server already waited on");
        let (tx, exited) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait());
        });
        match exited.recv_timeout(timeout) {
            Ok(status) => status.unwrap(),
            Err(_) => {
                self.send_signal("-KILL");
                panic!("forkpool-server did not exit within {timeout:?}");
            }
        }
    }

    fn send_signal(&self, signal: &str) -> bool {
        Command::new("kill")
            .args([signal, &self.pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn terminate(&self) {
        assert!(self.send_signal("-TERM"));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn free_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn get(endpoint: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(endpoint).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn serves_heals_and_shuts_down_on_sigterm() {
    let endpoint = free_endpoint();
    let mut server = Server::start(&endpoint, &["--shutdown-grace-ms", "2000"]);
    server.wait_for_log("workers are listening", Duration::from_secs(30));

    let response = get(&endpoint, "/");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    let pid: u32 = body.strip_prefix("process: ").unwrap().parse().unwrap();
    assert_ne!(pid, server.pid, "the supervisor never serves requests");

    let response = get(&endpoint, "/kill");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    server.wait_for_log("replaced worker", Duration::from_secs(10));
    server.wait_for_log("listening on", Duration::from_secs(10));

    server.terminate();
    let status = server.wait_for_exit(Duration::from_secs(15));
    assert!(status.success(), "{status:?}");
}

#[test]
fn exits_with_error_when_the_port_is_taken() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = taken.local_addr().unwrap().to_string();

    let mut server = Server::start(&endpoint, &["--startup-timeout-ms", "5000"]);
    let status = server.wait_for_exit(Duration::from_secs(20));
    assert!(!status.success(), "{status:?}");
    drop(taken);
}

#[test]
fn rejects_invalid_configuration() {
    let status = Command::new(BIN)
        .args(["--pool-size", "0"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}
