use std::sync::Arc;

use common::{
    persistence::Persistence,
    sync::{
        new_split_rw_lock,
        Reader,
    },
    types::{
        RepeatableTimestamp,
        Timestamp,
    },
};
use indexing::{
    IndexRegistry,
    MemoryIndexes,
};

use crate::{
    clock::TimestampOracle,
    committer::{
        Committer,
        CommitterClient,
    },
    query_cache::{
        CacheInvalidations,
        QueryCache,
    },
    snapshot_manager::{
        Snapshot,
        SnapshotManager,
    },
    subscription::{
        CommitFanout,
        Subscription,
        SubscriptionsClient,
        SubscriptionsWorker,
    },
    token::Token,
    transaction::Transaction,
    write_log::{
        new_write_log,
        LogReader,
    },
};

/// The assembled transactional core: every client query and mutation funnels
/// through one of these. Cloning shares the underlying workers.
#[derive(Clone)]
pub struct Database {
    committer: CommitterClient,
    subscriptions: SubscriptionsClient,
    log_reader: LogReader,
    snapshot_reader: Reader<SnapshotManager>,
    registry: IndexRegistry,
    cache: QueryCache,
}

impl Database {
    /// Bootstrap from persistence: load the latest durable snapshot, seed
    /// the timestamp source above the durable horizon, and start the
    /// committer and subscription workers.
    pub async fn load(
        persistence: Arc<dyn Persistence>,
        registry: IndexRegistry,
    ) -> anyhow::Result<Self> {
        Self::load_inner(persistence, registry, TimestampOracle::new).await
    }

    /// Bootstrap with a deterministic clock: commit timestamps are
    /// `horizon + 1, horizon + 2, ...`. Test support.
    pub async fn load_for_testing(
        persistence: Arc<dyn Persistence>,
        registry: IndexRegistry,
    ) -> anyhow::Result<Self> {
        Self::load_inner(persistence, registry, TimestampOracle::new_for_testing).await
    }

    async fn load_inner(
        persistence: Arc<dyn Persistence>,
        registry: IndexRegistry,
        make_oracle: fn(Timestamp) -> TimestampOracle,
    ) -> anyhow::Result<Self> {
        let (horizon, entries) = persistence.load_latest().await?;
        tracing::info!(
            "Loading database at ts {horizon} with {} documents",
            entries.len()
        );
        let documents = entries
            .into_iter()
            .filter_map(|entry| entry.value.map(|document| (entry.ts, document)))
            .collect();
        let indexes = MemoryIndexes::bootstrap(&registry, documents, horizon)?;
        let snapshot = Snapshot {
            index_registry: registry.clone(),
            indexes,
        };
        let (snapshot_reader, snapshot_writer) =
            new_split_rw_lock(SnapshotManager::new(horizon, snapshot));
        let (log_owner, log_reader, log_writer) = new_write_log(horizon);
        let clock = Arc::new(make_oracle(horizon));

        let committer = Committer::start(log_writer, snapshot_writer, persistence, clock);
        let invalidations = Arc::new(CacheInvalidations::new(horizon));
        let fanout: Vec<Arc<dyn CommitFanout>> = vec![invalidations.clone()];
        let subscriptions = SubscriptionsWorker::start(log_owner, fanout);
        let cache = QueryCache::new(invalidations, log_reader.clone());

        Ok(Self {
            committer,
            subscriptions,
            log_reader,
            snapshot_reader,
            registry,
            cache,
        })
    }

    /// Open a transaction at the latest published timestamp.
    pub fn begin(&self) -> Transaction {
        let begin_ts = self.snapshot_reader.lock().latest_ts();
        Transaction::new(begin_ts, self.registry.clone(), self.snapshot_reader.clone())
    }

    /// Open a transaction at a specific timestamp no newer than the latest
    /// published one. Reads fail with SnapshotTooOld when `ts` has aged out
    /// of the retention window.
    pub fn begin_at(&self, ts: Timestamp) -> anyhow::Result<Transaction> {
        let latest = self.snapshot_reader.lock().latest_ts();
        let begin_ts = latest.prior_ts(ts)?;
        Ok(Transaction::new(
            begin_ts,
            self.registry.clone(),
            self.snapshot_reader.clone(),
        ))
    }

    /// Finalize and submit a transaction. Resolves once the commit is
    /// durable and published, or with the failure taxonomy: an OCC abort
    /// (retry with a begin timestamp at or above the conflicting one), a
    /// schema or write error, a deadline overrun, or persistence
    /// unavailability.
    pub async fn commit(&self, transaction: Transaction) -> anyhow::Result<Timestamp> {
        self.committer.commit(transaction.finalize()?).await
    }

    pub fn latest_ts(&self) -> RepeatableTimestamp {
        self.snapshot_reader.lock().latest_ts()
    }

    /// Register a subscription on a token's read set.
    pub async fn subscribe(&self, token: Token) -> anyhow::Result<Subscription> {
        self.subscriptions.subscribe(token).await
    }

    /// Revalidate a token against the write log through `ts`. Returns the
    /// advanced token, or None when an overlapping commit (or log
    /// retention) invalidated it.
    pub fn refresh_token(&self, token: Token, ts: Timestamp) -> anyhow::Result<Option<Token>> {
        self.log_reader.refresh_token(token, ts)
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn shutdown(&self) {
        self.committer.shutdown();
        self.subscriptions.shutdown();
    }
}
