//! A consistent query result cache.
//!
//! Entries are keyed by `(function identity, argument fingerprint)` and
//! carry the read set (as a [`Token`]) of the execution that produced them.
//! Consistency comes from two mechanisms sharing the overlap-detection
//! machinery: a synchronous invalidation flag set by the commit fanout when
//! a published commit overlaps the entry's read set (hit-path cost: one
//! atomic load), and token revalidation against the write log for requests
//! past the fanout's processed timestamp. Concurrent misses for the same key
//! collapse to a single execution.

use std::{
    collections::BTreeMap,
    mem,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Instant,
};

use async_broadcast::{
    broadcast,
    Receiver,
    Sender,
};
use common::{
    document::{
        Document,
        DocumentUpdate,
    },
    knobs::{
        QUERY_CACHE_MAX_SIZE_BYTES,
        QUERY_CACHE_WAIT_TIMEOUT,
    },
    types::{
        IndexName,
        IndexedFields,
        Timestamp,
    },
    value::Value,
};
use futures::Future;
use interval_map::IntervalMap;
use lru::LruCache;
use parking_lot::Mutex;

use crate::{
    metrics,
    reads::ReadSet,
    subscription::CommitFanout,
    token::Token,
    write_log::LogReader,
};

/// Identity of a cached query: the function plus a fingerprint of its
/// arguments (the order-preserving value encoding, which is injective).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct CacheKey {
    function: String,
    args_fingerprint: Vec<u8>,
}

impl CacheKey {
    pub fn new(function: impl Into<String>, args: &Value) -> Self {
        let mut args_fingerprint = Vec::new();
        args.write_sort_key(&mut args_fingerprint);
        Self {
            function: function.into(),
            args_fingerprint,
        }
    }

    fn size(&self) -> usize {
        mem::size_of::<Self>() + self.function.len() + self.args_fingerprint.len()
    }
}

type CacheSlotId = usize;

#[derive(Clone)]
pub struct CacheResult {
    pub value: Arc<Value>,
    /// Begin timestamp of the execution that produced the value.
    original_ts: Timestamp,
    token: Token,
    invalid: Arc<AtomicBool>,
    slot: Option<CacheSlotId>,
}

impl CacheResult {
    pub fn token(&self) -> &Token {
        &self.token
    }

    fn size(&self) -> usize {
        self.value.size() + 64
    }
}

enum CacheEntry {
    Ready(CacheResult),
    Waiting {
        id: u64,
        started: Instant,
        receiver: Receiver<CacheResult>,
        // The executing peer's timestamp.
        ts: Timestamp,
    },
}

impl CacheEntry {
    fn size(&self) -> usize {
        mem::size_of::<Self>()
            + match self {
                CacheEntry::Ready(result) => result.size(),
                CacheEntry::Waiting { .. } => 0,
            }
    }
}

/// The invalidation registry maintained by the same fanout that feeds
/// subscriptions: an aggregated per-index interval map over all Ready cache
/// entries' read sets. When a published commit overlaps a registered read
/// set, the entry's flag is set synchronously and the slot retires
/// (invalidation is one-shot, like subscriptions).
pub struct CacheInvalidations {
    inner: Mutex<CacheInvalidationsInner>,
}

struct CacheInvalidationsInner {
    indexed: BTreeMap<IndexName, (IndexedFields, IntervalMap<CacheSlotId>)>,
    slots: slab::Slab<CacheSlot>,
    /// Every commit at or below this has been fanned out to the flags.
    processed_ts: Timestamp,
}

struct CacheSlot {
    invalid: Arc<AtomicBool>,
    reads: Arc<ReadSet>,
}

impl CacheInvalidations {
    pub fn new(initial_ts: Timestamp) -> Self {
        Self {
            inner: Mutex::new(CacheInvalidationsInner {
                indexed: BTreeMap::new(),
                slots: slab::Slab::new(),
                processed_ts: initial_ts,
            }),
        }
    }

    /// Register a read set whose token is valid at `valid_ts`. Fails when
    /// the fanout has already processed commits past `valid_ts`: the caller
    /// must refresh its token through the log and try again, which is the
    /// same replay-on-registration rule subscriptions follow.
    fn register(
        &self,
        reads: Arc<ReadSet>,
        invalid: Arc<AtomicBool>,
        valid_ts: Timestamp,
    ) -> Result<CacheSlotId, RegistrationLagged> {
        let mut inner = self.inner.lock();
        if valid_ts < inner.processed_ts {
            return Err(RegistrationLagged {
                processed_ts: inner.processed_ts,
            });
        }
        let slot = inner.slots.insert(CacheSlot {
            invalid,
            reads: reads.clone(),
        });
        for (index, index_reads) in reads.iter_indexed() {
            let (_, interval_map) = inner
                .indexed
                .entry(index.clone())
                .or_insert_with(|| (index_reads.fields.clone(), IntervalMap::new()));
            interval_map
                .insert(slot, index_reads.intervals.iter())
                .expect("cache interval map full");
        }
        Ok(slot)
    }

    fn unregister(&self, slot: CacheSlotId) {
        let mut inner = self.inner.lock();
        inner.remove_slot(slot);
    }
}

struct RegistrationLagged {
    processed_ts: Timestamp,
}

impl CacheInvalidationsInner {
    fn remove_slot(&mut self, slot: CacheSlotId) {
        let Some(entry) = self.slots.try_remove(slot) else {
            return;
        };
        for (index, _) in entry.reads.iter_indexed() {
            if let Some((_, interval_map)) = self.indexed.get_mut(index) {
                interval_map.remove(slot);
                if interval_map.is_empty() {
                    self.indexed.remove(index);
                }
            }
        }
    }

    fn overlapping(&self, document: &Document, hit: &mut Vec<CacheSlotId>) {
        for (index, (fields, interval_map)) in &self.indexed {
            if index.table() == document.id().table() {
                let index_key = document.index_key(fields).to_bytes();
                interval_map.query(&index_key, |slot| hit.push(slot));
            }
        }
    }
}

impl CommitFanout for CacheInvalidations {
    fn observe_commit(&self, _commit_ts: Timestamp, writes: &[DocumentUpdate]) {
        let mut inner = self.inner.lock();
        let mut hit = Vec::new();
        for update in writes {
            if let Some(old_document) = &update.old_document {
                inner.overlapping(old_document, &mut hit);
            }
            if let Some(new_document) = &update.new_document {
                inner.overlapping(new_document, &mut hit);
            }
        }
        for slot in hit {
            if let Some(entry) = inner.slots.get(slot) {
                entry.invalid.store(true, Ordering::SeqCst);
            }
            inner.remove_slot(slot);
        }
    }

    fn advance_processed(&self, ts: Timestamp) {
        let mut inner = self.inner.lock();
        assert!(inner.processed_ts <= ts);
        inner.processed_ts = ts;
    }
}

struct Inner {
    cache: LruCache<CacheKey, CacheEntry>,
    size: usize,
    size_limit: usize,
    next_waiting_id: u64,
}

/// The cache. `lookup`s require a caller timestamp; values returned are
/// exactly what a fresh execution at that timestamp would produce.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
    invalidations: Arc<CacheInvalidations>,
    log: LogReader,
}

enum CacheOp {
    Ready {
        result: CacheResult,
    },
    Wait {
        waiting_entry_id: u64,
        receiver: Receiver<CacheResult>,
    },
    Go {
        waiting_entry_id: Option<u64>,
        sender: Sender<CacheResult>,
    },
}

impl QueryCache {
    pub fn new(invalidations: Arc<CacheInvalidations>, log: LogReader) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache: LruCache::unbounded(),
                size: 0,
                size_limit: *QUERY_CACHE_MAX_SIZE_BYTES,
                next_waiting_id: 0,
            })),
            invalidations,
            log,
        }
    }

    /// Fetch the result of `key` at timestamp `ts`, executing `execute` on a
    /// miss. `execute` must run the query at `ts` and return the produced
    /// value together with the transaction's token. Concurrent gets for the
    /// same key collapse to one execution; followers receive the result if
    /// its validity covers their timestamp and re-issue otherwise.
    pub async fn get<F, Fut>(
        &self,
        key: CacheKey,
        ts: Timestamp,
        execute: F,
    ) -> anyhow::Result<CacheResult>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<(Value, Token)>>,
    {
        loop {
            // Step 1: decide what to do this iteration: serve a cached
            // value, wait for a peer, or execute ourselves.
            let Some(op) = self.plan_cache_op(&key, ts) else {
                continue;
            };

            let waiting_entry_id = match &op {
                CacheOp::Go {
                    waiting_entry_id, ..
                } => *waiting_entry_id,
                _ => None,
            };
            // The guard removes our waiting entry if we fail or get
            // dropped, so peers retry instead of hanging.
            let mut waiting_entry_guard = WaitingEntryGuard {
                entry_id: waiting_entry_id,
                key: &key,
                cache: self,
            };

            // Step 2: perform the operation, potentially executing.
            let (result, is_hit) = match op {
                CacheOp::Ready { result } => (result, true),
                CacheOp::Wait {
                    waiting_entry_id,
                    mut receiver,
                } => {
                    let recv = async {
                        match receiver.recv().await {
                            Ok(result) => Some(result),
                            Err(_) => None,
                        }
                    };
                    match tokio::time::timeout(*QUERY_CACHE_WAIT_TIMEOUT, recv).await {
                        Ok(Some(result)) => (result, true),
                        // The peer went away (likely an error); remove its
                        // entry and retry from the top.
                        Ok(None) => {
                            self.remove_waiting(&key, waiting_entry_id);
                            continue;
                        },
                        // We ran out of patience; the peer keeps its entry.
                        Err(_) => {
                            anyhow::bail!("Timed out waiting for a peer query execution");
                        },
                    }
                },
                CacheOp::Go { sender, .. } => {
                    let (value, token) = execute().await?;
                    let result = self.make_result(value, token)?;
                    let _ = sender.try_broadcast(result.clone());
                    if result.slot.is_some() {
                        waiting_entry_guard.complete(&result);
                    }
                    metrics::QUERY_CACHE_MISSES_TOTAL.inc();
                    return Ok(result);
                },
            };
            drop(waiting_entry_guard);

            // Step 3: validate the result for our timestamp.
            match self.validate_cache_result(&key, ts, result)? {
                Some(result) => {
                    if is_hit {
                        metrics::QUERY_CACHE_HITS_TOTAL.inc();
                    }
                    return Ok(result);
                },
                None => continue,
            }
        }
    }

    /// Build a cache result from an execution's output, registering its
    /// read set with the fanout. A token that goes stale before it can be
    /// registered yields an unregistered result (`slot: None`): still
    /// correct for the caller's timestamp, just not cacheable.
    fn make_result(&self, value: Value, token: Token) -> anyhow::Result<CacheResult> {
        let original_ts = token.ts();
        let invalid = Arc::new(AtomicBool::new(false));
        let mut refreshed = token.clone();
        // Registration must not trail the fanout's processed timestamp, or
        // the flag could miss a commit. Refreshing through the log advances
        // the token past it; a raced commit can force another round.
        let (slot, token) = loop {
            match self.invalidations.register(
                refreshed.reads_owned(),
                invalid.clone(),
                refreshed.ts(),
            ) {
                Ok(slot) => break (Some(slot), refreshed),
                Err(RegistrationLagged { processed_ts }) => {
                    match self.log.refresh_token(refreshed, processed_ts)? {
                        Some(advanced) => refreshed = advanced,
                        None => break (None, token),
                    }
                },
            }
        };
        Ok(CacheResult {
            value: Arc::new(value),
            original_ts,
            token,
            invalid,
            slot,
        })
    }

    fn plan_cache_op(&self, key: &CacheKey, ts: Timestamp) -> Option<CacheOp> {
        enum Planned {
            Miss,
            Invalidated,
            ValueTooNew,
            Ready(CacheResult),
            WaitPeer {
                id: u64,
                started: Instant,
                receiver: Receiver<CacheResult>,
                peer_ts: Timestamp,
            },
        }

        let mut inner = self.inner.lock();
        let planned = match inner.cache.get(key) {
            None => Planned::Miss,
            Some(CacheEntry::Ready(result)) => {
                if result.invalid.load(Ordering::SeqCst) {
                    Planned::Invalidated
                } else if ts < result.original_ts {
                    Planned::ValueTooNew
                } else {
                    Planned::Ready(result.clone())
                }
            },
            Some(CacheEntry::Waiting {
                id,
                started,
                receiver,
                ts: peer_ts,
            }) => Planned::WaitPeer {
                id: *id,
                started: *started,
                receiver: receiver.clone(),
                peer_ts: *peer_ts,
            },
        };
        let op = match planned {
            Planned::Miss => {
                let (sender, waiting_entry_id) = inner.put_waiting(key.clone(), ts);
                CacheOp::Go {
                    waiting_entry_id: Some(waiting_entry_id),
                    sender,
                }
            },
            Planned::Invalidated => {
                // Invalidated synchronously by the fanout; drop the entry
                // and execute, letting peers collapse onto us.
                inner.pop_entry(key, &self.invalidations);
                let (sender, waiting_entry_id) = inner.put_waiting(key.clone(), ts);
                CacheOp::Go {
                    waiting_entry_id: Some(waiting_entry_id),
                    sender,
                }
            },
            Planned::ValueTooNew => {
                // Another request already executed at a newer timestamp than
                // ours; the cached value may include commits we must not
                // see. Execute without publishing.
                let (sender, _) = broadcast(1);
                CacheOp::Go {
                    waiting_entry_id: None,
                    sender,
                }
            },
            Planned::Ready(result) => CacheOp::Ready { result },
            Planned::WaitPeer {
                id,
                started,
                receiver,
                peer_ts,
            } => {
                if peer_ts > ts {
                    // The peer executes at a timestamp we must not observe.
                    let (sender, _) = broadcast(1);
                    CacheOp::Go {
                        waiting_entry_id: None,
                        sender,
                    }
                } else if started.elapsed() >= *QUERY_CACHE_WAIT_TIMEOUT {
                    inner.remove_waiting_locked(key, id);
                    return None;
                } else {
                    CacheOp::Wait {
                        waiting_entry_id: id,
                        receiver,
                    }
                }
            },
        };
        Some(op)
    }

    fn validate_cache_result(
        &self,
        key: &CacheKey,
        ts: Timestamp,
        mut result: CacheResult,
    ) -> anyhow::Result<Option<CacheResult>> {
        if ts < result.original_ts {
            // The value was produced at a newer timestamp than requested.
            return Ok(None);
        }
        if result.invalid.load(Ordering::SeqCst) {
            self.remove_ready(key, result.original_ts);
            return Ok(None);
        }
        if result.token.ts() < ts {
            // The fanout has not caught up to the requested timestamp;
            // revalidate directly against the write log.
            result.token = match self.log.refresh_token(result.token.clone(), ts)? {
                Some(token) => token,
                None => {
                    self.remove_ready(key, result.original_ts);
                    return Ok(None);
                },
            };
            // Remember the advanced validity for future hits.
            self.put_ready(key.clone(), result.clone());
        }
        Ok(Some(result))
    }

    fn remove_waiting(&self, key: &CacheKey, entry_id: u64) {
        self.inner.lock().remove_waiting_locked(key, entry_id)
    }

    fn remove_ready(&self, key: &CacheKey, original_ts: Timestamp) {
        let mut inner = self.inner.lock();
        if let Some(CacheEntry::Ready(result)) = inner.cache.peek(key) {
            if result.original_ts == original_ts {
                inner.pop_entry(key, &self.invalidations);
            }
        }
        metrics::QUERY_CACHE_SIZE_BYTES.set(inner.size as i64);
    }

    fn put_ready(&self, key: CacheKey, result: CacheResult) {
        let mut inner = self.inner.lock();
        inner.put_ready(key, result, &self.invalidations);
        inner.enforce_size_limit(&self.invalidations);
        metrics::QUERY_CACHE_SIZE_BYTES.set(inner.size as i64);
    }
}

impl Inner {
    fn pop_entry(&mut self, key: &CacheKey, invalidations: &CacheInvalidations) {
        if let Some((popped_key, entry)) = self.cache.pop_entry(key) {
            self.size -= popped_key.size() + entry.size();
            if let CacheEntry::Ready(result) = entry {
                if let Some(slot) = result.slot {
                    invalidations.unregister(slot);
                }
            }
        }
    }

    fn remove_waiting_locked(&mut self, key: &CacheKey, entry_id: u64) {
        if let Some(CacheEntry::Waiting { id, .. }) = self.cache.peek(key) {
            if *id == entry_id {
                let (popped_key, entry) = self.cache.pop_entry(key).expect("peeked above");
                self.size -= popped_key.size() + entry.size();
            }
        }
    }

    fn put_waiting(&mut self, key: CacheKey, ts: Timestamp) -> (Sender<CacheResult>, u64) {
        let id = self.next_waiting_id;
        self.next_waiting_id += 1;

        let (sender, receiver) = broadcast(1);
        let new_entry = CacheEntry::Waiting {
            id,
            receiver,
            started: Instant::now(),
            ts,
        };
        let new_size = key.size() + new_entry.size();
        let old_size = self
            .cache
            .push(key, new_entry)
            .map(|(old_key, old_entry)| old_key.size() + old_entry.size())
            .unwrap_or(0);
        // Add before subtracting: the old entry can be larger than the new.
        self.size = self.size + new_size - old_size;
        (sender, id)
    }

    /// Install a Ready entry, keeping whichever of the old and new values
    /// has the higher timestamp.
    fn put_ready(&mut self, key: CacheKey, result: CacheResult, invalidations: &CacheInvalidations) {
        match self.cache.peek_mut(&key) {
            Some(entry @ CacheEntry::Waiting { .. }) => {
                let new_entry = CacheEntry::Ready(result);
                self.size -= entry.size();
                self.size += new_entry.size();
                *entry = new_entry;
            },
            Some(CacheEntry::Ready(existing)) => {
                let newer = existing.original_ts < result.original_ts
                    || (existing.original_ts == result.original_ts
                        && existing.token.ts() < result.token.ts());
                let same_slot = Arc::ptr_eq(&existing.invalid, &result.invalid);
                if newer {
                    if let Some(slot) = existing.slot {
                        if !same_slot {
                            invalidations.unregister(slot);
                        }
                    }
                    self.size -= existing.size();
                    self.size += result.size();
                    *existing = result;
                } else if !same_slot {
                    // The arriving value lost the race; retire its slot.
                    if let Some(slot) = result.slot {
                        invalidations.unregister(slot);
                    }
                }
            },
            None => {
                let new_entry = CacheEntry::Ready(result);
                self.size += key.size() + new_entry.size();
                self.cache.push(key, new_entry);
            },
        }
    }

    /// Pop least-recently-used records until the cache is under budget.
    fn enforce_size_limit(&mut self, invalidations: &CacheInvalidations) {
        while self.size > self.size_limit {
            let (popped_key, popped_entry) = self
                .cache
                .pop_lru()
                .expect("cache is over budget without any items");
            self.size -= popped_key.size() + popped_entry.size();
            if let CacheEntry::Ready(result) = popped_entry {
                if let Some(slot) = result.slot {
                    invalidations.unregister(slot);
                }
            }
        }
    }
}

/// Removes the waiting entry when the executing future errors or is
/// dropped, even on cancellation.
struct WaitingEntryGuard<'a> {
    entry_id: Option<u64>,
    key: &'a CacheKey,
    cache: &'a QueryCache,
}

impl WaitingEntryGuard<'_> {
    /// Replace the waiting entry with the finished result.
    fn complete(&mut self, result: &CacheResult) {
        if let Some(entry_id) = self.entry_id.take() {
            self.cache.remove_waiting(self.key, entry_id);
            self.cache.put_ready(self.key.clone(), result.clone());
        }
    }
}

impl Drop for WaitingEntryGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry_id) = self.entry_id {
            self.cache.remove_waiting(self.key, entry_id)
        }
    }
}
