use std::{
    borrow::Borrow,
    cmp::{
        self,
        Ordering,
    },
    sync::Arc,
};

use common::{
    document::Document,
    index::IndexKeyBytes,
    interval::Interval,
    types::{
        IndexName,
        Timestamp,
    },
};
use imbl::{
    OrdMap,
    OrdSet,
};

use crate::index_registry::{
    IndexRegistry,
    IndexUpdate,
    IndexValue,
};

#[derive(Debug)]
struct IndexEntry {
    key: IndexKeyBytes,
    ts: Timestamp,
    document: Document,
}

// OrdMap/OrdSet are sensitive to the size of their elements and clone them
// at will, so the set stores a single Arc.
#[derive(Clone, Debug)]
struct ArcIndexEntry(Arc<IndexEntry>);

impl Borrow<[u8]> for ArcIndexEntry {
    fn borrow(&self) -> &[u8] {
        &self.0.key[..]
    }
}

impl PartialEq for ArcIndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.key.eq(&other.0.key)
    }
}

impl Eq for ArcIndexEntry {}

impl PartialOrd for ArcIndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArcIndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.key.cmp(&other.0.key)
    }
}

/// One index's entries, ordered by key, versioned by cheap structural
/// sharing: cloning the map is O(1) and the committer's mutations copy only
/// the touched path. All in-memory indexes are clustered: the entry carries
/// the full document revision and the timestamp that produced it.
#[derive(Clone, Debug)]
pub struct DatabaseIndexMap {
    inner: OrdSet<ArcIndexEntry>,
    /// The timestamp of the last update to this index.
    last_modified: Timestamp,
}

impl DatabaseIndexMap {
    fn new_at(ts: Timestamp) -> Self {
        Self {
            inner: OrdSet::new(),
            last_modified: ts,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The entries within `interval`, in ascending key order.
    pub fn range(
        &self,
        interval: &Interval,
    ) -> impl DoubleEndedIterator<Item = (IndexKeyBytes, Timestamp, Document)> + '_ {
        self.inner
            .range(interval)
            .map(|e| (e.0.key.clone(), e.0.ts, e.0.document.clone()))
    }

    fn insert(&mut self, key: IndexKeyBytes, ts: Timestamp, document: Document) {
        self.inner.insert(ArcIndexEntry(Arc::new(IndexEntry {
            key,
            ts,
            document,
        })));
        self.last_modified = cmp::max(self.last_modified, ts);
    }

    fn remove(&mut self, key: &IndexKeyBytes, ts: Timestamp) {
        self.inner.remove::<[u8]>(key);
        self.last_modified = cmp::max(self.last_modified, ts);
    }
}

/// All in-memory indexes. The committer owns the only mutable copy; every
/// published snapshot holds an immutable clone.
#[derive(Clone, Debug)]
pub struct MemoryIndexes {
    indexes: OrdMap<IndexName, DatabaseIndexMap>,
}

impl MemoryIndexes {
    /// Build fully loaded indexes from a bootstrap snapshot of the latest
    /// revision of every document.
    pub fn bootstrap(
        registry: &IndexRegistry,
        documents: Vec<(Timestamp, Document)>,
        snapshot_ts: Timestamp,
    ) -> anyhow::Result<Self> {
        let mut indexes = OrdMap::new();
        for index in registry.all_indexes() {
            indexes.insert(index.name.clone(), DatabaseIndexMap::new_at(snapshot_ts));
        }
        let mut loaded = Self { indexes };
        for (ts, document) in documents {
            registry.require_table(document.id().table())?;
            for update in registry.index_updates(None, Some(&document)) {
                loaded.apply(update, ts);
            }
        }
        Ok(loaded)
    }

    /// Apply one document's change at `ts`, returning the index updates for
    /// observability. Called only by the committer, in commit order.
    pub fn update(
        &mut self,
        registry: &IndexRegistry,
        ts: Timestamp,
        deletion: Option<&Document>,
        insertion: Option<&Document>,
    ) -> Vec<IndexUpdate> {
        let updates = registry.index_updates(deletion, insertion);
        for update in &updates {
            self.apply(update.clone(), ts);
        }
        updates
    }

    fn apply(&mut self, update: IndexUpdate, ts: Timestamp) {
        let Some(index_map) = self.indexes.get_mut(&update.index_name) else {
            return;
        };
        match update.value {
            IndexValue::Deleted => index_map.remove(&update.key, ts),
            IndexValue::Document(document) => index_map.insert(update.key, ts, document),
        }
    }

    /// Range over one index. Returns the entries in `interval` in the key
    /// order; the caller applies direction and limits.
    pub fn range(
        &self,
        index_name: &IndexName,
        interval: &Interval,
    ) -> anyhow::Result<Vec<(IndexKeyBytes, Timestamp, Document)>> {
        let index_map = self
            .indexes
            .get(index_name)
            .ok_or_else(|| anyhow::anyhow!("Index {index_name} is not loaded"))?;
        Ok(index_map.range(interval).collect())
    }

    pub fn last_modified(&self, index_name: &IndexName) -> Option<Timestamp> {
        self.indexes.get(index_name).map(|m| m.last_modified)
    }
}
