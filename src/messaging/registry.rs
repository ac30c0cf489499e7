// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-quality-level subscriber registry.
//!
//! Maps `ElementFqId -> set of subscriber PIDs`, guarded by a
//! `parking_lot::RwLock` so delivery (many concurrent readers) never
//! blocks behind registration churn (occasional writers) — the shape
//! message-passing internals use throughout spec §5 ("shared_mutex to
//! allow parallel readers while handlers iterate").

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;

use crate::config::NOTIFICATION_COPY_BATCH;
use crate::element_id::ElementFqId;

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<ElementFqId, BTreeSet<i32>>>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, fq_id: ElementFqId, pid: i32) {
        self.subscribers.write().entry(fq_id).or_default().insert(pid);
    }

    pub fn unregister(&self, fq_id: ElementFqId, pid: i32) {
        if let Some(set) = self.subscribers.write().get_mut(&fq_id) {
            set.remove(&pid);
        }
    }

    pub fn remove_pid_everywhere(&self, pid: i32) {
        let mut subscribers = self.subscribers.write();
        for set in subscribers.values_mut() {
            set.remove(&pid);
        }
    }

    /// Copy at most `NOTIFICATION_COPY_BATCH` subscriber PIDs for `fq_id`
    /// greater than `cursor`, holding the read lock only for this one
    /// batch. Returns the batch and whether more entries remain beyond
    /// it, so the caller can resume from the last-copied PID on the next
    /// call — `NodeIdentifierCopier`'s discipline (spec §4.10's "bounded
    /// temporary buffer... iteration resumes from the last copied PID").
    fn copy_batch(&self, fq_id: ElementFqId, cursor: Option<i32>) -> (Vec<i32>, bool) {
        let subscribers = self.subscribers.read();
        let Some(set) = subscribers.get(&fq_id) else {
            return (Vec::new(), false);
        };
        let lower = match cursor {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        let mut iter = set.range((lower, Bound::Unbounded));
        let batch: Vec<i32> = iter.by_ref().take(NOTIFICATION_COPY_BATCH).copied().collect();
        let more = iter.next().is_some();
        (batch, more)
    }

    /// Copy every subscriber PID for `fq_id`, acquiring the read lock
    /// once per batch of at most `NOTIFICATION_COPY_BATCH` entries and
    /// releasing it in between.
    #[must_use]
    pub fn copy_subscriber_pids(&self, fq_id: ElementFqId) -> Vec<i32> {
        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let (batch, more) = self.copy_batch(fq_id, cursor);
            cursor = batch.last().copied().or(cursor);
            all.extend(batch);
            if !more {
                break;
            }
        }
        all
    }

    /// Same as [`Self::copy_subscriber_pids`] but keeps the bounded
    /// batches separate instead of flattening them, for callers that want
    /// to interleave delivery with further registration changes between
    /// batches.
    #[must_use]
    pub fn copy_subscriber_pids_batched(&self, fq_id: ElementFqId) -> Vec<Vec<i32>> {
        let mut batches = Vec::new();
        let mut cursor = None;
        loop {
            let (batch, more) = self.copy_batch(fq_id, cursor);
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().copied();
            batches.push(batch);
            if !more {
                break;
            }
        }
        batches
    }
}
