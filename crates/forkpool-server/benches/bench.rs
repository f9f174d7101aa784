use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::{StreamExt, stream::FuturesUnordered};
use std::{
    net::TcpStream,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    runtime::Builder,
};

const ENDPOINT: &str = "127.0.0.1:3000";

#[derive(Clone, Copy, Debug)]
struct HttpBenchParams {
    path: &'static str,
    concurrency: usize,
}

fn http_bench(c: &mut Criterion) {
    // Start the server. This may require a full compilation so set the timeout
    // high. Adjust features and CLI args to the server as necessary.
    let mut server = Command::new("cargo")
        .args([
            "run",
            "--bin",
            "forkpool-server",
            "--release",
            "--",
            "--endpoint",
            ENDPOINT,
        ])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("Failed to start forkpool-server");
    wait_for_port(ENDPOINT, 300);

    let paths = ["/", "/fast"];
    let concurrency_cases = [1, 8, 32, 128];

    // Generate cartesian product of all param combinations
    let mut cases = Vec::new();
    for &path in &paths {
        for &concurrency in &concurrency_cases {
            cases.push(HttpBenchParams { path, concurrency });
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let mut group = c.benchmark_group("http/get");
        group.throughput(Throughput::Elements(params.concurrency as u64));

        group.bench_function(
            format!("path/{}/conc/{}", params.path, params.concurrency),
            |b| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let start = Instant::now();
                    for _ in 0..iters {
                        run_http_bench(params).await;
                    }
                    start.elapsed()
                });
            },
        );

        group.finish();
    }

    if server.kill().is_err() {
        eprintln!("failed to kill server");
    }
}

async fn run_http_bench(params: &HttpBenchParams) {
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.concurrency {
        let path = params.path;
        tasks.push(tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(ENDPOINT)
                .await
                .expect("connect failed");
            let request =
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
            stream
                .write_all(request.as_bytes())
                .await
                .expect("write failed");

            let mut response = Vec::new();
            stream
                .read_to_end(&mut response)
                .await
                .expect("read failed");
            assert!(
                response.starts_with(b"HTTP/1.1 200"),
                "unexpected response: {}",
                String::from_utf8_lossy(&response)
            );
            black_box(response);
        }));
    }

    // Wait for all tasks to complete
    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

pub fn wait_for_port(addr: &str, timeout_secs: u64) {
    let start = Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Server did not start listening on {}", addr);
}

criterion_group!(http_benches, http_bench);
criterion_main!(http_benches);
