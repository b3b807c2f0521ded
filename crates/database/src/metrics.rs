use std::sync::LazyLock;

use prometheus::{
    register_histogram,
    register_int_counter,
    register_int_gauge,
    Histogram,
    IntCounter,
    IntGauge,
};

pub static COMMITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("database_commits_total", "Published commits").unwrap()
});

pub static COMMIT_ROWS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "database_commit_rows_total",
        "Document revisions published by commits"
    )
    .unwrap()
});

pub static OCC_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "database_occ_conflicts_total",
        "Commits aborted by conflict validation"
    )
    .unwrap()
});

pub static COMMIT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "database_commit_seconds",
        "Time from commit submission to publish"
    )
    .unwrap()
});

pub static PERSISTENCE_WRITE_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "database_persistence_write_seconds",
        "Durability barrier latency per commit"
    )
    .unwrap()
});

pub static PENDING_WRITES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "database_pending_writes",
        "Commits staged but not yet published"
    )
    .unwrap()
});

pub static SUBSCRIPTIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("database_subscriptions_active", "Registered subscriptions").unwrap()
});

pub static SUBSCRIPTIONS_INVALIDATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "database_subscriptions_invalidated_total",
        "Subscription invalidation events emitted"
    )
    .unwrap()
});

pub static QUERY_CACHE_HITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("database_query_cache_hits_total", "Query cache hits").unwrap()
});

pub static QUERY_CACHE_MISSES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("database_query_cache_misses_total", "Query cache misses").unwrap()
});

pub static QUERY_CACHE_SIZE_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "database_query_cache_size_bytes",
        "Approximate bytes held by the query cache"
    )
    .unwrap()
});

/// The committer refusing further work is always worth an alert.
pub fn shutdown_error() -> anyhow::Error {
    anyhow::anyhow!("Committer has shut down and no longer accepts requests")
}
