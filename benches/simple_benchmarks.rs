//! Performance benchmarks for the request-path hot spots

use corridor_bridge::cache::cache_key;
use corridor_bridge::common::{ProxyMetrics, ResponseBuilder};
use corridor_bridge::routes::{RouteRule, RouteTable};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hyper::{Method, StatusCode};
use std::sync::Arc;

/// Benchmark cache key derivation
fn bench_cache_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_keys");

    let plain = RouteRule::default();
    group.bench_function("get_plain", |b| {
        b.iter(|| {
            let key = cache_key(&plain, &Method::GET, "/raas/masters/v1/codes", None, b"");
            black_box(key);
        });
    });

    let rates = RouteRule {
        include_query_in_key: true,
        ..RouteRule::default()
    };
    group.bench_function("get_with_query", |b| {
        b.iter(|| {
            let key = cache_key(
                &rates,
                &Method::GET,
                "/raas/masters/v1/rates",
                Some("from=AED&to=PKR"),
                b"",
            );
            black_box(key);
        });
    });

    let digesting = RouteRule {
        cache_post_bodies: true,
        ..RouteRule::default()
    };
    let body = vec![b'q'; 256];
    group.bench_function("post_with_body_digest", |b| {
        b.iter(|| {
            let key = cache_key(
                &digesting,
                &Method::POST,
                "/amr/ras/api/v1_0/ras/quote",
                None,
                &body,
            );
            black_box(key);
        });
    });

    group.finish();
}

/// Benchmark route table classification
fn bench_route_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_classification");

    let table = RouteTable::new(RouteRule::default_table(
        "/auth/realms/cdp/protocol/openid-connect/token",
    ));

    group.bench_function("specific_prefix", |b| {
        b.iter(|| {
            let rule = table.classify(&Method::GET, "/raas/masters/v1/rates");
            black_box(rule);
        });
    });

    group.bench_function("catch_all", |b| {
        b.iter(|| {
            let rule = table.classify(&Method::POST, "/amr/ras/api/v1_0/ras/createtransaction");
            black_box(rule);
        });
    });

    group.finish();
}

/// Benchmark metrics operations
fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");

    let metrics = Arc::new(ProxyMetrics::new());

    group.bench_function("increment_requests", |b| {
        b.iter(|| {
            metrics.requests_total.inc();
        });
    });

    group.bench_function("snapshot", |b| {
        b.iter(|| {
            let summary = metrics.snapshot();
            black_box(summary);
        });
    });

    group.bench_function("encode_prometheus", |b| {
        b.iter(|| {
            let text = metrics.encode_prometheus();
            black_box(text);
        });
    });

    group.finish();
}

/// Benchmark failure envelope construction
fn bench_failure_envelopes(c: &mut Criterion) {
    let mut group = c.benchmark_group("failure_envelopes");

    group.bench_function("not_found", |b| {
        b.iter(|| {
            let response = ResponseBuilder::failure(
                StatusCode::NOT_FOUND,
                40400,
                "Endpoint not found",
                Some("No handler defined for /missing"),
            );
            black_box(response);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_keys,
    bench_route_classification,
    bench_metrics,
    bench_failure_envelopes
);
criterion_main!(benches);
