//! Streaming codec benchmarks
//!
//! - Encoding plain and async-heavy result trees into line-framed bodies
//! - Decoding those bodies back into resolved JSON
//! - Router dispatch through a middleware chain

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures::StreamExt;
use nexus_rpc::prelude::*;
use serde_json::{Value, json};
use std::hint::black_box;

fn plain_tree(width: usize) -> Value {
    let items: Vec<Value> = (0..width)
        .map(|i| json!({"id": i, "title": format!("post {i}"), "tags": ["a", "b"]}))
        .collect();
    json!({"items": items, "total": width})
}

/// Roots with one deferred value and one short sequence each.
fn async_roots(count: usize) -> Vec<(String, StreamValue)> {
    (0..count)
        .map(|i| {
            let value = StreamValue::object([
                ("id", StreamValue::Json(json!(i))),
                (
                    "detail",
                    StreamValue::deferred(async move { Ok(json!({"n": i}).into()) }),
                ),
                (
                    "events",
                    LazySequence::from_values(vec![json!(1), json!(2), json!(3)]).into(),
                ),
            ]);
            (i.to_string(), value)
        })
        .collect()
}

async fn encode_to_lines(roots: Vec<(String, StreamValue)>) -> Vec<String> {
    to_jsonl(encode(roots, EncoderOptions::new()))
        .map(|line| line.unwrap())
        .collect()
        .await
}

fn bench_encode_plain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("encode_plain");

    for width in [10usize, 100, 1000].iter() {
        let tree = plain_tree(*width);
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let roots = vec![("0".to_string(), StreamValue::Json(tree.clone()))];
                    black_box(encode_to_lines(roots).await)
                })
            });
        });
    }

    group.finish();
}

fn bench_encode_async(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("encode_async");

    for count in [1usize, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| rt.block_on(async { black_box(encode_to_lines(async_roots(count)).await) }));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("decode");

    for count in [1usize, 10, 50].iter() {
        let lines = rt.block_on(encode_to_lines(async_roots(*count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let body = futures::stream::iter(
                        lines.iter().cloned().map(Ok::<String, String>).collect::<Vec<_>>(),
                    );
                    let decoded = decode(body).await.unwrap();
                    let mut out = Vec::with_capacity(decoded.values.len());
                    for (_, value) in decoded.values {
                        out.push(value.resolve_all().await.unwrap());
                    }
                    black_box(out)
                })
            });
        });
    }

    group.finish();
}

fn bench_router_call(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("router_call");

    for depth in [0usize, 1, 5].iter() {
        let mut builder = Procedure::builder();
        for _ in 0..*depth {
            builder = builder.use_middleware(|_opts: MiddlewareOptions, next: Next| async move {
                Ok(next.run().await)
            });
        }
        let router = Router::builder()
            .procedure(
                "bench.echo",
                builder.query(|opts: ResolverOptions| async move { Ok::<_, RpcError>(opts.input) }),
            )
            .build()
            .unwrap();
        let input = json!({"value": 42});

        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        router
                            .call(CallOptions::new("bench.echo", ProcedureType::Query, input.clone()))
                            .await
                            .unwrap(),
                    )
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_plain,
    bench_encode_async,
    bench_decode,
    bench_router_call
);
criterion_main!(benches);
