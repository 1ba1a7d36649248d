//! Benchmark for the response cache hit path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use rpc_shield::metrics::Metrics;
use rpc_shield::rpc_config::CacheConfig;
use rpc_shield::{fingerprint, TwoTierCache};

fn bench_fingerprint(c: &mut Criterion) {
    let params = json!(["9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin", {"encoding": "base64", "commitment": "confirmed"}]);

    c.bench_function("fingerprint", |b| {
        b.iter(|| fingerprint(black_box("default"), black_box("getAccountInfo"), black_box(&params)));
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let cache = TwoTierCache::new(CacheConfig::default(), Arc::new(Metrics::new().unwrap()));
    let ttl = Duration::from_secs(3600);

    // Fill the main tier well past the hot tier
    for i in 0..1_000u64 {
        cache.set(cache.key_for("getAccountInfo", &json!([i])), json!({"lamports": i}), ttl);
    }
    let hot = cache.key_for("getAccountInfo", &json!([7u64]));
    let cold = cache.key_for("getAccountInfo", &json!([512u64]));

    c.bench_function("cache_hit_hot", |b| {
        b.iter(|| {
            rt.block_on(cache.get(black_box(hot), ttl, || async { Ok(json!(null)) }))
                .unwrap()
        });
    });

    c.bench_function("cache_peek_main", |b| {
        b.iter(|| black_box(cache.peek(black_box(&cold))));
    });
}

criterion_group!(benches, bench_fingerprint, bench_cache_hit);
criterion_main!(benches);
