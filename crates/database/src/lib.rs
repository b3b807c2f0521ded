//! The transactional core of the database: a serializable
//! optimistic-concurrency engine over a multi-version log, with read-set
//! based invalidation powering realtime subscriptions and a consistent
//! query result cache.
//!
//! Every query and mutation funnels through [`Database`]: transactions read
//! immutable snapshots at their begin timestamp and accumulate read and
//! write sets; the single-writer [`committer`] assigns commit timestamps,
//! validates reads against the window of concurrent writes, persists, and
//! publishes; published commits fan out to subscriptions and the cache
//! through the shared overlap-detection machinery in [`reads`].

pub mod clock;
pub mod committer;
pub mod database;
pub mod metrics;
pub mod query_cache;
pub mod reads;
pub mod snapshot_manager;
pub mod subscription;
pub mod test_helpers;
pub mod token;
pub mod transaction;
pub mod transaction_index;
pub mod write_log;
pub mod writes;

pub use crate::{
    clock::TimestampOracle,
    committer::CommitterClient,
    database::Database,
    query_cache::{
        CacheKey,
        QueryCache,
    },
    reads::{
        ConflictingRead,
        ConflictingReadWithWriteTs,
        IndexReads,
        ReadSet,
        TransactionReadSet,
    },
    snapshot_manager::{
        Snapshot,
        SnapshotManager,
    },
    subscription::{
        CommitFanout,
        Subscription,
        SubscriptionsClient,
    },
    token::Token,
    transaction::{
        FinalTransaction,
        Transaction,
    },
    transaction_index::CursorPosition,
    writes::Writes,
};
