//! gh2 benchmarks
//!
//! Request/response round trips over an in-memory pipe, measuring the cost of
//! the adapter layers (stream registration, dispatch, body pumping) on top of
//! the framing engine.

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gh2::client::{self, Connection};
use gh2::server::Server;
use gh2::{ConnectionContext, RecvBody};
use http::{Request, Response};
use std::convert::Infallible;
use tokio::runtime::Runtime;
use tower::service_fn;

async fn echo(request: Request<RecvBody>) -> Result<Response<Bytes>, gh2::Error> {
    let body = request.into_body().collect().await?;
    Ok(Response::new(body))
}

fn setup(rt: &Runtime) -> Connection {
    rt.block_on(async {
        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        let server = Server::builder()
            .initial_stream_window_size(1 << 20)
            .build(service_fn(|_ctx: ConnectionContext| async {
                Ok::<_, Infallible>(service_fn(echo))
            }));
        tokio::spawn(async move {
            let _ = server.serve(server_io).await;
        });

        client::Builder::new()
            .initial_stream_window_size(1 << 20)
            .connect(client_io)
            .await
            .expect("client connection")
    })
}

/// Benchmark a single empty exchange
fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connection = setup(&rt);
    let mut group = c.benchmark_group("round_trip");

    group.bench_function("empty_body", |b| {
        b.to_async(&rt).iter(|| async {
            let request = Request::get("http://bench.gh2/").body(()).unwrap();
            let response = connection.send(request).await.unwrap();
            black_box(response.into_body().collect().await.unwrap())
        });
    });

    group.finish();
}

/// Benchmark echo throughput for several payload sizes
fn bench_echo_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connection = setup(&rt);
    let mut group = c.benchmark_group("echo_throughput");

    for size in [1024usize, 64 * 1024, 512 * 1024] {
        let payload = Bytes::from(vec![0x42; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                let request = Request::post("http://bench.gh2/echo")
                    .body(payload.clone())
                    .unwrap();
                let response = connection.send(request).await.unwrap();
                black_box(response.into_body().collect().await.unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark concurrent exchanges multiplexed on one connection
fn bench_concurrent_streams(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connection = setup(&rt);
    let mut group = c.benchmark_group("concurrent_streams");

    for streams in [8usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(streams), &streams, |b, &streams| {
            b.to_async(&rt).iter(|| async {
                let pending = (0..streams).map(|_| {
                    let request = Request::get("http://bench.gh2/").body(()).unwrap();
                    connection.send(request)
                });
                black_box(futures::future::join_all(pending).await)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_echo_throughput,
    bench_concurrent_streams
);
criterion_main!(benches);
