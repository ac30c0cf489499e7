// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crash-safe transaction logs and the rollback executor that replays
//! them after a participant dies mid-operation.
//!
//! A transaction is recorded as a plain (non-atomic) BEGIN store, the
//! operation itself, then a plain END store with a release fence. A
//! crash between BEGIN and END is exactly the failure mode this module
//! exists to detect: on reopen, `begin && !end` means the operation never
//! completed and must be compensated for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::collections::HashMap;

use crate::error::Result;

/// One begin/end pair for a single ring-slot or subscribe operation.
/// Plain (non-atomic) fields: only the transaction's *owner* ever writes
/// to its own log while it is alive, so there is no concurrent writer to
/// race against; a release fence after `end = true` is what makes the
/// write visible to a rollback executor running in another process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionLogSlot {
    pub begin: bool,
    pub end: bool,
}

impl TransactionLogSlot {
    #[must_use]
    pub fn is_dangling(&self) -> bool {
        self.begin && !self.end
    }

    pub fn record_begin(&mut self) {
        self.begin = true;
        self.end = false;
        std::sync::atomic::fence(Ordering::Release);
    }

    pub fn record_end(&mut self) {
        self.end = true;
        std::sync::atomic::fence(Ordering::Release);
    }

    pub fn clear(&mut self) {
        self.begin = false;
        self.end = false;
    }
}

/// Per-(participant, event) record of in-flight slot references and the
/// one subscribe operation a participant may have outstanding.
pub struct TransactionLog {
    pub reference_slots: Vec<TransactionLogSlot>,
    pub subscribe_slot: TransactionLogSlot,
    pub recorded_max_sample_count: u16,
}

impl TransactionLog {
    #[must_use]
    pub fn new(ring_depth: usize) -> Self {
        Self {
            reference_slots: vec![TransactionLogSlot::default(); ring_depth],
            subscribe_slot: TransactionLogSlot::default(),
            recorded_max_sample_count: 0,
        }
    }

    pub fn begin_reference(&mut self, slot_index: usize) {
        self.reference_slots[slot_index].record_begin();
    }

    pub fn end_reference(&mut self, slot_index: usize) {
        self.reference_slots[slot_index].record_end();
    }

    pub fn begin_subscribe(&mut self, requested_max_samples: u16) {
        self.recorded_max_sample_count = requested_max_samples;
        self.subscribe_slot.record_begin();
    }

    pub fn end_subscribe(&mut self) {
        self.subscribe_slot.record_end();
    }
}

/// Identifies the owning participant of a [`TransactionLogNode`] — the
/// producer's UID/application-id for a proxy slot, or a fixed sentinel
/// for the skeleton-tracing slot.
pub type TransactionLogId = u32;

/// One entry in a [`TransactionLogSet`].
pub struct TransactionLogNode {
    active: AtomicBool,
    needs_rollback: AtomicBool,
    id: Mutex<Option<TransactionLogId>>,
    pub log: Mutex<TransactionLog>,
}

impl TransactionLogNode {
    #[must_use]
    pub fn new(ring_depth: usize) -> Self {
        Self {
            active: AtomicBool::new(false),
            needs_rollback: AtomicBool::new(false),
            id: Mutex::new(None),
            log: Mutex::new(TransactionLog::new(ring_depth)),
        }
    }

    /// CAS-register this node for `id`. Returns `false` if another
    /// transaction log is already active in this slot.
    #[must_use]
    pub fn register(&self, id: TransactionLogId) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.id.lock().unwrap() = Some(id);
        true
    }

    #[must_use]
    pub fn id(&self) -> Option<TransactionLogId> {
        *self.id.lock().unwrap()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn mark_needs_rollback(&self) {
        self.needs_rollback.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn needs_rollback(&self) -> bool {
        self.needs_rollback.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.needs_rollback.store(false, Ordering::Release);
        *self.id.lock().unwrap() = None;
        self.active.store(false, Ordering::Release);
    }
}

/// Per-event set of transaction logs: `N` proxy slots plus one
/// distinguished skeleton-tracing slot, linear-scanned by
/// `TransactionLogId`.
pub struct TransactionLogSet {
    proxy_nodes: Vec<TransactionLogNode>,
    skeleton_node: TransactionLogNode,
}

impl TransactionLogSet {
    #[must_use]
    pub fn new(max_subscribers: usize, ring_depth: usize) -> Self {
        Self {
            proxy_nodes: (0..max_subscribers)
                .map(|_| TransactionLogNode::new(ring_depth))
                .collect(),
            skeleton_node: TransactionLogNode::new(ring_depth),
        }
    }

    #[must_use]
    pub fn skeleton_node(&self) -> &TransactionLogNode {
        &self.skeleton_node
    }

    /// Register a new proxy transaction log for `id`, claiming the first
    /// free slot. Returns `None` if the set is full.
    pub fn register_proxy(&self, id: TransactionLogId) -> Option<&TransactionLogNode> {
        for node in &self.proxy_nodes {
            if node.register(id) {
                return Some(node);
            }
        }
        None
    }

    /// Returns the node already active for `id`, if one exists, otherwise
    /// claims a fresh one. Repeated calls from the same participant (e.g.
    /// a `receive` followed by its matching `release`) must land on the
    /// same node so their begin/end brackets compose into one log entry
    /// instead of each call claiming its own.
    pub fn get_or_register_proxy(&self, id: TransactionLogId) -> Option<&TransactionLogNode> {
        self.find_by_id(id).next().or_else(|| self.register_proxy(id))
    }

    fn find_by_id(&self, id: TransactionLogId) -> impl Iterator<Item = &TransactionLogNode> {
        self.proxy_nodes
            .iter()
            .filter(move |n| n.is_active() && n.id() == Some(id))
    }

    /// Mark every node owned by `id` as needing rollback (§4.4 step 3).
    pub fn mark_owned_by(&self, id: TransactionLogId) {
        for node in self.find_by_id(id) {
            node.mark_needs_rollback();
        }
    }
}

/// Callbacks the rollback executor invokes to compensate for a dangling
/// transaction. Kept as plain closures rather than a trait object
/// hierarchy, collapsing the source's deep binding-class hierarchy into
/// one boundary seam (spec §9).
pub struct RollbackCallbacks<'a> {
    /// Called once per dangling reference-transaction slot; must
    /// decrement the slot's refcount and reclaim it if it reaches zero.
    pub dereference: &'a dyn Fn(usize) -> Result<()>,
    /// Called once for a dangling subscribe-transaction; must unsubscribe
    /// using the recorded max-sample count.
    pub unsubscribe: &'a dyn Fn(u16) -> Result<()>,
}

/// Process-local map of per-segment rollback-synchronization mutexes,
/// keyed by the segment's base address as seen by this process. Ensures
/// rollback work for a given segment happens at most once per process,
/// even if multiple proxies for the same instance run concurrently.
#[derive(Default)]
pub struct RollbackSyncRegistry {
    locks: Mutex<HashMap<usize, ()>>,
}

impl RollbackSyncRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this is the first call for `segment_key` in this
    /// process (the caller should proceed with rollback); `false` if a
    /// prior call already completed it.
    pub fn claim_once(&self, segment_key: usize) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.contains_key(&segment_key) {
            false
        } else {
            locks.insert(segment_key, ());
            true
        }
    }
}

/// Executes the rollback protocol of spec §4.4 against one
/// [`TransactionLogSet`] for a given [`TransactionLogId`].
///
/// Processes at most one dangling log per invocation so repeated calls
/// (e.g. from a retry loop) are re-entrant and make forward progress
/// without holding any lock across the whole set.
pub fn rollback_transaction_logs(
    set: &TransactionLogSet,
    id: TransactionLogId,
    callbacks: &RollbackCallbacks<'_>,
) -> Result<()> {
    set.mark_owned_by(id);

    for node in set.find_by_id(id) {
        if !node.needs_rollback() {
            continue;
        }

        let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());

        for (index, slot) in log.reference_slots.iter_mut().enumerate() {
            if slot.is_dangling() {
                (callbacks.dereference)(index)?;
                slot.clear();
            }
        }

        if log.subscribe_slot.is_dangling() {
            (callbacks.unsubscribe)(log.recorded_max_sample_count)?;
            log.subscribe_slot.clear();
        }

        drop(log);
        node.deactivate();
        return Ok(());
    }

    Ok(())
}
