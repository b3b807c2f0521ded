//! Tracks subscribers to query read sets and notifies them when a published
//! commit overlaps.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    document::{
        Document,
        DocumentUpdate,
    },
    knobs::SUBSCRIPTIONS_QUEUE_SIZE,
    types::{
        IndexName,
        IndexedFields,
        SubscriberId,
        Timestamp,
    },
};
use interval_map::IntervalMap;
use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::{
    mpsc,
    oneshot,
    watch,
};

use crate::{
    metrics,
    reads::ReadSet,
    token::Token,
    write_log::{
        LogOwner,
        LogReader,
    },
};

type Sequence = usize;

#[derive(Clone, Copy, Debug)]
struct SubscriptionKey {
    id: SubscriberId,
    seq: Sequence,
}

/// A hook receiving every published commit, in commit order, driven by the
/// same worker that fans out to subscriptions. The query cache registers
/// its invalidation index here.
pub trait CommitFanout: Send + Sync + 'static {
    fn observe_commit(&self, commit_ts: Timestamp, writes: &[DocumentUpdate]);

    /// Every commit at or below `ts` has been delivered to `observe_commit`.
    fn advance_processed(&self, ts: Timestamp);
}

#[derive(Clone)]
pub struct SubscriptionsClient {
    handle: Arc<Mutex<tokio::task::JoinHandle<()>>>,
    log: LogReader,
    sender: mpsc::Sender<SubscriptionRequest>,
}

impl SubscriptionsClient {
    /// Register a token's read set. The token is first revalidated against
    /// the write log up to the log's max timestamp: a token whose reads have
    /// already been overwritten yields an immediately-invalid subscription
    /// rather than an error, since the client's next step is the same
    /// either way: re-run the query.
    pub async fn subscribe(&self, token: Token) -> anyhow::Result<Subscription> {
        let token = match self.log.refresh_reads_until_max_ts(token)? {
            Some(token) => token,
            None => return Ok(Subscription::invalid(self.sender.clone())),
        };
        let (tx, rx) = oneshot::channel();
        let request = SubscriptionRequest::Subscribe { token, result: tx };
        self.sender
            .send(request)
            .await
            .map_err(|_| metrics::shutdown_error())?;
        rx.await.map_err(|_| metrics::shutdown_error())
    }

    pub fn shutdown(&self) {
        self.handle.lock().abort();
    }
}

enum SubscriptionRequest {
    Subscribe {
        token: Token,
        result: oneshot::Sender<Subscription>,
    },
    Cancel(SubscriptionKey),
}

pub struct SubscriptionsWorker {
    subscriptions: SubscriptionManager,
    fanout: Vec<Arc<dyn CommitFanout>>,
}

impl SubscriptionsWorker {
    pub(crate) fn start(log: LogOwner, fanout: Vec<Arc<dyn CommitFanout>>) -> SubscriptionsClient {
        let (tx, rx) = mpsc::channel(*SUBSCRIPTIONS_QUEUE_SIZE);

        let log_reader = log.reader();
        let worker = Self {
            subscriptions: SubscriptionManager::new(tx.clone(), log),
            fanout,
        };
        let handle = tokio::spawn(worker.go(rx));
        SubscriptionsClient {
            handle: Arc::new(Mutex::new(handle)),
            log: log_reader,
            sender: tx,
        }
    }

    async fn go(mut self, mut rx: mpsc::Receiver<SubscriptionRequest>) {
        tracing::info!("Starting subscriptions worker");
        loop {
            tokio::select! {
                request = rx.recv() => {
                    match request {
                        Some(SubscriptionRequest::Subscribe { token, result }) => {
                            match self.subscriptions.subscribe(token) {
                                Ok(subscription) => {
                                    let _: Result<_, _> = result.send(subscription);
                                },
                                Err(e) => {
                                    tracing::error!("Subscription registration failed: {e:#}");
                                },
                            }
                        },
                        Some(SubscriptionRequest::Cancel(key)) => {
                            self.subscriptions.remove(key);
                        },
                        None => {
                            tracing::info!(
                                "All clients have gone away, shutting down subscriptions \
                                 worker..."
                            );
                            break;
                        },
                    }
                },
                next_ts = self.subscriptions.wait_for_next_ts() => {
                    if let Err(e) = self.subscriptions.advance_log(next_ts, &self.fanout) {
                        tracing::error!("Subscription fanout failed: {e:#}");
                    }
                },
            }
        }
    }
}

/// Tracks every live subscriber and the aggregated per-index interval
/// structure used to invert overlap detection: index keys from each new
/// commit drive stabbing queries across all subscriptions at once.
pub struct SubscriptionManager {
    subscribers: Slab<Subscriber>,
    subscriptions: SubscriptionMap,
    next_seq: Sequence,

    log: LogOwner,

    // The timestamp up to which this worker has processed the log. May lag
    // the committer. Invariant: every subscriber's read set is valid at
    // `processed_ts`.
    processed_ts: Timestamp,

    sender: mpsc::Sender<SubscriptionRequest>,
}

struct Subscriber {
    reads: Arc<ReadSet>,
    valid_ts: Arc<Mutex<Option<Timestamp>>>,
    valid: watch::Sender<SubscriptionState>,
    seq: Sequence,
}

impl SubscriptionManager {
    fn new(sender: mpsc::Sender<SubscriptionRequest>, log: LogOwner) -> Self {
        let processed_ts = log.max_ts();
        Self {
            subscribers: Slab::new(),
            subscriptions: SubscriptionMap::new(),
            next_seq: 0,
            log,
            processed_ts,
            sender,
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn new_for_testing() -> Self {
        let (log_owner, ..) = crate::write_log::new_write_log(Timestamp::MIN);
        let (tx, _rx) = mpsc::channel(16);
        Self::new(tx, log_owner)
    }

    pub fn subscribe(&mut self, mut token: Token) -> anyhow::Result<Subscription> {
        // The client may not have refreshed its token up to our processed
        // timestamp; finish the job by replaying the log over
        // `(token.ts, processed_ts]`. Tokens past `processed_ts` are fine:
        // we will just reprocess some log entries they already covered.
        if token.ts() < self.processed_ts {
            token = match self.log.refresh_token(token, self.processed_ts)? {
                Some(token) => token,
                None => return Ok(Subscription::invalid(self.sender.clone())),
            };
        }
        assert!(token.ts() >= self.processed_ts);

        let entry = self.subscribers.vacant_entry();
        let subscriber_id = entry.key();

        self.subscriptions.insert(subscriber_id, token.reads());

        let valid_ts = Arc::new(Mutex::new(Some(token.ts())));
        let (valid_tx, valid_rx) = watch::channel(SubscriptionState::Valid);
        let seq = self.next_seq;
        let key = SubscriptionKey {
            id: subscriber_id,
            seq,
        };
        self.next_seq += 1;
        entry.insert(Subscriber {
            reads: token.reads_owned(),
            valid_ts: valid_ts.clone(),
            valid: valid_tx,
            seq,
        });
        metrics::SUBSCRIPTIONS_ACTIVE.set(self.subscribers.len() as i64);
        Ok(Subscription {
            valid_ts,
            valid: valid_rx,
            key: Some(key),
            sender: self.sender.clone(),
        })
    }

    pub async fn wait_for_next_ts(&mut self) -> Timestamp {
        self.log.wait_for_higher_ts(self.processed_ts).await
    }

    /// Process commits in `(processed_ts, next_ts]`: emit exactly one
    /// invalidation for each subscriber whose read set overlaps a commit in
    /// the window (tagged with the first conflicting commit), advance
    /// everyone else, and feed every commit to the fanout hooks in order.
    pub fn advance_log(
        &mut self,
        next_ts: Timestamp,
        fanout: &[Arc<dyn CommitFanout>],
    ) -> anyhow::Result<()> {
        let from_ts = self.processed_ts.succ()?;

        let mut to_notify: BTreeMap<SubscriberId, Timestamp> = BTreeMap::new();
        self.log.for_each(from_ts, next_ts, |commit_ts, writes| {
            for update in writes {
                // The prior revision leaves the read set's intervals, the
                // new one enters them; either direction invalidates.
                if let Some(old_document) = &update.old_document {
                    self.overlapping(old_document, commit_ts, &mut to_notify);
                }
                if let Some(new_document) = &update.new_document {
                    self.overlapping(new_document, commit_ts, &mut to_notify);
                }
            }
            for hook in fanout {
                hook.observe_commit(commit_ts, writes);
            }
        })?;
        for hook in fanout {
            hook.advance_processed(next_ts);
        }

        // First advance all the subscriptions that remain valid.
        for (subscriber_id, subscriber) in &mut self.subscribers {
            if !to_notify.contains_key(&subscriber_id) {
                *subscriber.valid_ts.lock() = Some(next_ts);
            }
        }
        // Then invalidate the rest. Invalidation is one-shot: the
        // subscription leaves the active set and clients re-subscribe with
        // a fresh query result.
        for (subscriber_id, conflict_ts) in to_notify {
            self._remove(subscriber_id, Some(conflict_ts));
            metrics::SUBSCRIPTIONS_INVALIDATED_TOTAL.inc();
        }

        assert!(self.processed_ts <= next_ts);
        self.processed_ts = next_ts;

        // Enforce retention only after the subscriptions have caught up.
        self.log.enforce_retention_policy(next_ts);
        Ok(())
    }

    fn overlapping(
        &self,
        document: &Document,
        commit_ts: Timestamp,
        to_notify: &mut BTreeMap<SubscriberId, Timestamp>,
    ) {
        for (index, (fields, range_map)) in &self.subscriptions.indexed {
            if index.table() == document.id().table() {
                let index_key = document.index_key(fields).to_bytes();
                range_map.query(&index_key, |subscriber_id| {
                    // Keep the first conflicting commit for the event.
                    to_notify.entry(subscriber_id).or_insert(commit_ts);
                });
            }
        }
    }

    fn get_subscriber(&self, key: SubscriptionKey) -> Option<&Subscriber> {
        let entry = self.subscribers.get(key.id)?;
        if entry.seq > key.seq {
            // The slab slot was reused by a newer subscription.
            return None;
        }
        assert_eq!(entry.seq, key.seq);
        Some(entry)
    }

    /// Remove the given subscription if it still exists.
    pub fn remove(&mut self, key: SubscriptionKey) {
        if self.get_subscriber(key).is_none() {
            return;
        }
        self._remove(key.id, None);
    }

    fn _remove(&mut self, id: SubscriberId, invalidated_at: Option<Timestamp>) {
        let entry = self.subscribers.remove(id);
        *entry.valid_ts.lock() = None;
        let _ = entry.valid.send(SubscriptionState::Invalid { invalidated_at });
        self.subscriptions.remove(id, &entry.reads);
        metrics::SUBSCRIPTIONS_ACTIVE.set(self.subscribers.len() as i64);
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn processed_ts(&self) -> Timestamp {
        self.processed_ts
    }
}

#[derive(Copy, Clone)]
enum SubscriptionState {
    Valid,
    Invalid {
        /// The commit that invalidated the read set, or None for removal
        /// without a conflicting commit (cancellation, stale registration).
        invalidated_at: Option<Timestamp>,
    },
}

/// A live subscription on the read set of a prior read-only transaction.
/// Dropping it unsubscribes.
pub struct Subscription {
    valid_ts: Arc<Mutex<Option<Timestamp>>>,
    valid: watch::Receiver<SubscriptionState>,
    key: Option<SubscriptionKey>,
    sender: mpsc::Sender<SubscriptionRequest>,
}

impl Subscription {
    fn invalid(sender: mpsc::Sender<SubscriptionRequest>) -> Self {
        let (_, receiver) = watch::channel(SubscriptionState::Invalid {
            invalidated_at: None,
        });
        Subscription {
            valid_ts: Arc::new(Mutex::new(None)),
            valid: receiver,
            key: None,
            sender,
        }
    }

    /// The timestamp through which this subscription's reads are known
    /// valid, or None once invalidated.
    pub fn current_ts(&self) -> Option<Timestamp> {
        *self.valid_ts.lock()
    }

    /// Resolves when the subscription is invalidated, yielding the commit
    /// that caused it when there was one.
    pub async fn wait_for_invalidation(&self) -> Option<Timestamp> {
        let mut valid = self.valid.clone();
        let result = valid
            .wait_for(|state| matches!(state, SubscriptionState::Invalid { .. }))
            .await;
        match result {
            Ok(state) => match *state {
                SubscriptionState::Invalid { invalidated_at } => invalidated_at,
                SubscriptionState::Valid => None,
            },
            // The worker dropped the sender without invalidating us.
            Err(_) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _: Result<_, _> = self.sender.try_send(SubscriptionRequest::Cancel(key));
        }
    }
}

/// The aggregated interval structure across all subscribers, per index.
struct SubscriptionMap {
    indexed: BTreeMap<IndexName, (IndexedFields, IntervalMap<SubscriberId>)>,
}

impl SubscriptionMap {
    fn new() -> Self {
        Self {
            indexed: BTreeMap::new(),
        }
    }

    fn insert(&mut self, id: SubscriberId, reads: &ReadSet) {
        for (index, index_reads) in reads.iter_indexed() {
            let (_, interval_map) = self
                .indexed
                .entry(index.clone())
                .or_insert_with(|| (index_reads.fields.clone(), IntervalMap::new()));
            interval_map
                .insert(id, index_reads.intervals.iter())
                .expect("subscription interval map full");
        }
    }

    fn remove(&mut self, id: SubscriberId, reads: &ReadSet) {
        for (index, _) in reads.iter_indexed() {
            let (_, range_map) = self
                .indexed
                .get_mut(index)
                .unwrap_or_else(|| panic!("Missing index entry for {index}"));
            range_map.remove(id);
            if range_map.is_empty() {
                self.indexed.remove(index);
            }
        }
    }
}
