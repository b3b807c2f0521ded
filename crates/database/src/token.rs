//! Tokens record the read state a query observed, for later revalidation.

use std::sync::Arc;

use common::types::Timestamp;

use crate::reads::ReadSet;

/// A read set plus the timestamp through which it is known valid: no commit
/// in `(0, ts]` overlaps it. Subscriptions and cache entries hold one; the
/// write log advances or invalidates it.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    reads: Arc<ReadSet>,
    ts: Timestamp,
}

impl Token {
    pub fn new(reads: ReadSet, ts: Timestamp) -> Self {
        Self {
            reads: Arc::new(reads),
            ts,
        }
    }

    pub fn empty(ts: Timestamp) -> Self {
        Self::new(ReadSet::empty(), ts)
    }

    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn reads(&self) -> &ReadSet {
        &self.reads
    }

    pub fn reads_owned(&self) -> Arc<ReadSet> {
        self.reads.clone()
    }

    /// Advance the validity timestamp after revalidation against the log.
    pub fn advance_ts(&mut self, ts: Timestamp) {
        assert!(self.ts < ts);
        self.ts = ts;
    }
}
