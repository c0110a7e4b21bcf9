use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "HTTP cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "HTTP cache store calls")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_REMOVALS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_removals_total", "Index removals by reason");
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_removals_total");
    vec
});

static GENERATION_ROTATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_generation_rotations_total",
        "New generations opened after the active one filled up",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_generation_rotations_total");
    counter
});

static GENERATION_PROMOTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_generation_promotions_total",
        "Payload files moved into the active generation",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_generation_promotions_total");
    counter
});

static GENERATION_PRUNED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_generation_pruned_total",
        "Generations deleted past the retention count",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_generation_pruned_total");
    counter
});

static GENERATION_PRUNE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_generation_prune_failures_total",
        "Generation deletions that left files behind",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_generation_prune_failures_total");
    counter
});

static SNAPSHOT_SAVE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_snapshot_save_total", "Index snapshot writes by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_snapshot_save_total");
    vec
});

static SNAPSHOT_LOAD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_snapshot_load_total", "Index snapshot loads by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_snapshot_load_total");
    vec
});

/// `result` is one of `hit`, `miss` or `stale`.
pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_removal(reason: &str) {
    CACHE_REMOVALS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_generation_rotation() {
    GENERATION_ROTATIONS_TOTAL.inc();
}

pub fn record_promotion() {
    GENERATION_PROMOTIONS_TOTAL.inc();
}

pub fn record_generation_pruned() {
    GENERATION_PRUNED_TOTAL.inc();
}

pub fn record_generation_prune_failure() {
    GENERATION_PRUNE_FAILURES_TOTAL.inc();
}

pub fn record_snapshot_save(ok: bool) {
    let label = if ok { "ok" } else { "error" };
    SNAPSHOT_SAVE_TOTAL.with_label_values(&[label]).inc();
}

/// `result` is one of `restored`, `empty` or `discarded`.
pub fn record_snapshot_load(result: &str) {
    SNAPSHOT_LOAD_TOTAL.with_label_values(&[result]).inc();
}

pub fn gather() -> Result<Vec<u8>> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String> {
    String::from_utf8(gather()?).context("metrics output is not valid UTF-8")
}
