//! Tunable limits and parameters.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each has a comment explaining what it bounds so it can be adjusted
//! safely for a deployment.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Maximum size of a single document.
pub static MAX_DOCUMENT_SIZE_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_DOCUMENT_SIZE_BYTES", 1 << 20));

/// Entries retained in the in-memory write log regardless of age. The write
/// log bounds the OCC conflict-detection window: commits whose begin
/// timestamp predates the log's horizon fail with SnapshotTooOld.
pub static WRITE_LOG_MAX_ENTRIES: LazyLock<usize> =
    LazyLock::new(|| env_config("WRITE_LOG_MAX_ENTRIES", 4096));

/// Write log entries younger than this are never trimmed, even over the
/// entry budget.
pub static WRITE_LOG_MIN_RETENTION_SECS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("WRITE_LOG_MIN_RETENTION_SECS", 10)));

/// Write log entries older than this are trimmed unconditionally.
pub static WRITE_LOG_MAX_RETENTION_SECS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("WRITE_LOG_MAX_RETENTION_SECS", 300)));

/// How far behind the latest published timestamp a transaction may begin.
/// This is the MVCC retention window: snapshots older than this are
/// reclaimed and reads at them fail with SnapshotTooOld.
pub static MAX_TRANSACTION_WINDOW: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("MAX_TRANSACTION_WINDOW_SECS", 10)));

/// Commit submissions queued at the committer before submitters block.
pub static COMMITTER_QUEUE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("COMMITTER_QUEUE_SIZE", 256));

/// Staged-but-unpublished commits before the committer stops accepting new
/// submissions. Backpressure, not abort: submitters wait for pending to
/// drain.
pub static PENDING_WRITES_HIGH_WATER: LazyLock<usize> =
    LazyLock::new(|| env_config("PENDING_WRITES_HIGH_WATER", 16));

/// Default wall-clock deadline for a transaction, checked at finalize.
pub static TRANSACTION_DEADLINE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("TRANSACTION_DEADLINE_SECS", 10)));

/// Maximum documents written in a single transaction.
pub static TRANSACTION_MAX_NUM_WRITES: LazyLock<usize> =
    LazyLock::new(|| env_config("TRANSACTION_MAX_NUM_WRITES", 8192));

/// Maximum bytes written in a single transaction.
pub static TRANSACTION_MAX_WRITE_SIZE_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("TRANSACTION_MAX_WRITE_SIZE_BYTES", 1 << 24));

/// Maximum documents read in a single transaction.
pub static TRANSACTION_MAX_READ_SIZE_ROWS: LazyLock<usize> =
    LazyLock::new(|| env_config("TRANSACTION_MAX_READ_SIZE_ROWS", 16384));

/// Maximum bytes read in a single transaction.
pub static TRANSACTION_MAX_READ_SIZE_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("TRANSACTION_MAX_READ_SIZE_BYTES", 1 << 23));

/// Maximum distinct read-set intervals per transaction. Bounds the cost of
/// conflict detection and subscription registration.
pub static TRANSACTION_MAX_READ_SET_INTERVALS: LazyLock<usize> =
    LazyLock::new(|| env_config("TRANSACTION_MAX_READ_SET_INTERVALS", 4096));

/// Byte budget for the query result cache; least-recently-used entries are
/// evicted beyond it.
pub static QUERY_CACHE_MAX_SIZE_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("QUERY_CACHE_MAX_SIZE_BYTES", 100 << 20));

/// How long a cache miss waits on a peer executing the same query before
/// giving up and executing itself.
pub static QUERY_CACHE_WAIT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUERY_CACHE_WAIT_TIMEOUT_SECS", 10)));

/// Buffered requests on the subscription worker's queue.
pub static SUBSCRIPTIONS_QUEUE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("SUBSCRIPTIONS_QUEUE_SIZE", 10000));
