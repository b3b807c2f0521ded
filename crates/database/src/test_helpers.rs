//! Test support: an in-memory, fault-injectable persistence implementation
//! and a prebuilt database fixture over a minimal schema.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    document::DocumentId,
    interval::{
        End,
        Interval,
        StartIncluded,
    },
    persistence::{
        DocumentLogEntry,
        Persistence,
    },
    types::{
        IndexDescriptor,
        IndexName,
        Timestamp,
    },
    value::Value,
};
use indexing::IndexRegistry;
use parking_lot::Mutex;

use crate::database::Database;

/// In-memory persistence honoring the write contract: append-ordered,
/// one timestamp per write call, atomic per commit. Writes can be made to
/// fail or stall for durability-window tests.
pub struct TestPersistence {
    inner: Arc<Mutex<TestPersistenceInner>>,
    pause: tokio::sync::watch::Sender<bool>,
    write_attempts: std::sync::atomic::AtomicUsize,
}

struct TestPersistenceInner {
    log: BTreeMap<Timestamp, Vec<DocumentLogEntry>>,
    fail_writes: bool,
}

impl TestPersistence {
    pub fn new() -> Arc<Self> {
        let (pause, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            inner: Arc::new(Mutex::new(TestPersistenceInner {
                log: BTreeMap::new(),
                fail_writes: false,
            })),
            pause,
            write_attempts: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().fail_writes = failing;
    }

    /// While paused, `write` calls block before touching the log, holding
    /// their commits in the staged-but-not-durable window.
    pub fn set_paused(&self, paused: bool) {
        self.pause.send_replace(paused);
    }

    /// Writes that have entered `write`, including ones currently paused.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn max_ts(&self) -> Option<Timestamp> {
        self.inner.lock().log.keys().next_back().copied()
    }
}

#[async_trait]
impl Persistence for TestPersistence {
    async fn write(&self, entries: Vec<DocumentLogEntry>) -> anyhow::Result<()> {
        self.write_attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut paused = self.pause.subscribe();
        while *paused.borrow() {
            paused.changed().await?;
        }
        let mut inner = self.inner.lock();
        anyhow::ensure!(!inner.fail_writes, "injected persistence failure");
        let Some(ts) = entries.first().map(|entry| entry.ts) else {
            return Ok(());
        };
        anyhow::ensure!(
            entries.iter().all(|entry| entry.ts == ts),
            "write carries multiple timestamps"
        );
        if let Some(max_ts) = inner.log.keys().next_back() {
            anyhow::ensure!(*max_ts < ts, "write at {ts} not beyond {max_ts}");
        }
        inner.log.insert(ts, entries);
        Ok(())
    }

    async fn load_latest(&self) -> anyhow::Result<(Timestamp, Vec<DocumentLogEntry>)> {
        let inner = self.inner.lock();
        let max_ts = inner
            .log
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Timestamp::MIN);
        // Latest revision per document, in log order; tombstones drop out.
        let mut latest: BTreeMap<DocumentId, DocumentLogEntry> = BTreeMap::new();
        for entries in inner.log.values() {
            for entry in entries {
                match &entry.value {
                    Some(_) => {
                        latest.insert(entry.id.clone(), entry.clone());
                    },
                    None => {
                        latest.remove(&entry.id);
                    },
                }
            }
        }
        Ok((max_ts, latest.into_values().collect()))
    }
}

/// The minimal schema the scenario tests run against: table `items` with a
/// secondary index on `qty`.
pub fn items_registry() -> IndexRegistry {
    let mut registry = IndexRegistry::new();
    registry
        .register_table("items".parse().expect("valid table name"))
        .expect("fresh registry");
    registry
        .register_index(
            "items".parse().expect("valid table name"),
            IndexDescriptor::new("by_qty").expect("valid descriptor"),
            vec!["qty".parse().expect("valid field name")]
                .try_into()
                .expect("one field"),
        )
        .expect("fresh registry");
    registry
}

pub fn items_by_qty() -> IndexName {
    IndexName::new(
        "items".parse().expect("valid table name"),
        IndexDescriptor::new("by_qty").expect("valid descriptor"),
    )
}

/// The interval of `items.by_qty` keys with `lo <= qty < hi`.
pub fn qty_range(lo: i64, hi: i64) -> Interval {
    let mut start = Vec::new();
    Value::Int64(lo).write_sort_key(&mut start);
    let mut end = Vec::new();
    Value::Int64(hi).write_sort_key(&mut end);
    Interval {
        start: StartIncluded(start.into()),
        end: End::Excluded(end.into()),
    }
}

pub struct DbFixture {
    pub database: Database,
    pub persistence: Arc<TestPersistence>,
}

impl DbFixture {
    /// A deterministic database over [`items_registry`]: commit timestamps
    /// start at 1 and increase by one.
    pub async fn new() -> anyhow::Result<Self> {
        let persistence = TestPersistence::new();
        let database =
            Database::load_for_testing(persistence.clone(), items_registry()).await?;
        Ok(Self {
            database,
            persistence,
        })
    }
}
