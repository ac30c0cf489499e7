// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A single entry in an event's bounded payload ring.
//!
//! # Memory Ordering Strategy
//!
//! - **Release** on the WRITING→READY transition (`publish`): ensures the
//!   payload write that preceded it is visible to any reader that
//!   subsequently observes READY via an Acquire load. This is the
//!   happens-before edge the whole protocol depends on (spec §5: "publish
//!   happens-before any corresponding Receive on the same slot").
//! - **Acquire** on the state load in `receive`/`try_allocate`: pairs with
//!   the Release above.
//! - **AcqRel** on refcount `fetch_add`/`fetch_sub`: the reference count
//!   itself has no ordering requirement beyond not tearing, but AcqRel
//!   keeps it synchronized with the surrounding state CAS it is always
//!   paired with.
//!
//! # State Machine
//!
//! ```text
//! FREE --CAS(writer)--> WRITING --release store--> READY --refcount 0 & CAS--> FREE
//! ```
//!
//! While `state == WRITING`, `refcount == 0` and exactly one writer holds
//! the slot. While `state == READY`, `refcount` is the number of
//! outstanding reader references. A slot becomes FREE again only when its
//! refcount has dropped to zero AND the writer has released the WRITING
//! flag (i.e. `Publish` has already run) — both conditions, not either.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::offset_ptr::OffsetPtr;

/// Observed/target state of an [`EventSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    Writing = 1,
    Ready = 2,
}

impl SlotState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Writing,
            _ => Self::Ready,
        }
    }
}

/// One slot of an event's payload ring, cache-line aligned to avoid
/// false sharing between the writer (skeleton) and the many readers
/// (proxies) that poll neighboring slots.
#[repr(C, align(64))]
pub struct EventSlot {
    /// Monotonic publish timestamp, used by the allocator to pick the
    /// oldest eligible slot.
    pub timestamp: AtomicU64,
    /// Outstanding reader references. Zero while FREE or WRITING.
    pub refcount: AtomicU32,
    state: AtomicU32,
    /// Offset pointer to this slot's payload storage in the DATA
    /// segment.
    pub payload_offset: OffsetPtr<u8>,
}

// SAFETY: EventSlot is designed for concurrent cross-process access; all
// mutable fields are atomics, and payload_offset is read-only after
// construction (written once by the skeleton before any proxy opens the
// segment).
unsafe impl Send for EventSlot {}
unsafe impl Sync for EventSlot {}

impl EventSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timestamp: AtomicU64::new(0),
            refcount: AtomicU32::new(0),
            state: AtomicU32::new(SlotState::Free as u32),
            payload_offset: OffsetPtr::null(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SlotState {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Attempt the FREE/READY-with-refcount-0 → WRITING transition. The
    /// allocator in `EventDataControl` calls this once per candidate
    /// slot; a `false` return means another writer (impossible in this
    /// single-writer model, but kept symmetric with the CAS-loop
    /// discipline used throughout) or a reader raced ahead and the
    /// caller should re-evaluate eligibility.
    #[must_use]
    pub fn try_begin_writing(&self) -> bool {
        let observed = self.state.load(Ordering::Acquire);
        let eligible = observed == SlotState::Free as u32
            || (observed == SlotState::Ready as u32 && self.refcount.load(Ordering::Acquire) == 0);
        if !eligible {
            return false;
        }
        self.state
            .compare_exchange(
                observed,
                SlotState::Writing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Release-store the WRITING→READY transition after the payload and
    /// timestamp have been written. This is the publish barrier: every
    /// write issued before this call is guaranteed visible to any reader
    /// that subsequently observes READY.
    pub fn publish(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
        self.state.store(SlotState::Ready as u32, Ordering::Release);
    }

    /// Roll a dangling WRITING slot back to FREE (used by the skeleton's
    /// own transaction-log rollback after a crash between
    /// `try_begin_writing` and `publish`).
    pub fn force_free(&self) {
        self.state.store(SlotState::Free as u32, Ordering::Release);
    }

    /// Reader-side acquire: observe READY, then increment refcount.
    /// Returns `false` if the slot is not currently READY (caller should
    /// treat this as "nothing to read", not an error).
    #[must_use]
    pub fn acquire_reference(&self) -> bool {
        if self.state.load(Ordering::Acquire) != SlotState::Ready as u32 {
            return false;
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Reader-side release: decrement refcount; if it reaches zero and
    /// the slot is (still) READY, attempt the READY→FREE transition.
    /// Returns `Err` on refcount underflow, which the caller must treat
    /// as corruption (fatal, per spec §7).
    pub fn release_reference(&self) -> Result<(), ()> {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Undo the decrement into negative territory before reporting.
            self.refcount.fetch_add(1, Ordering::AcqRel);
            return Err(());
        }
        if prev == 1 {
            let _ = self.state.compare_exchange(
                SlotState::Ready as u32,
                SlotState::Free as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        Ok(())
    }
}

impl Default for EventSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_one_cache_line() {
        assert_eq!(std::mem::align_of::<EventSlot>(), 64);
    }

    #[test]
    fn full_lifecycle_returns_to_free() {
        let slot = EventSlot::new();
        assert_eq!(slot.state(), SlotState::Free);

        assert!(slot.try_begin_writing());
        assert_eq!(slot.state(), SlotState::Writing);

        slot.publish(100);
        assert_eq!(slot.state(), SlotState::Ready);

        assert!(slot.acquire_reference());
        assert_eq!(slot.refcount.load(Ordering::Acquire), 1);

        slot.release_reference().unwrap();
        assert_eq!(slot.refcount.load(Ordering::Acquire), 0);
        assert_eq!(slot.state(), SlotState::Free);
    }

    #[test]
    fn ready_with_zero_refcount_is_eligible_for_reallocation() {
        let slot = EventSlot::new();
        slot.try_begin_writing();
        slot.publish(1);
        // no reader ever acquired a reference; still eligible
        assert!(slot.try_begin_writing());
    }

    #[test]
    fn ready_with_outstanding_refcount_is_not_eligible() {
        let slot = EventSlot::new();
        slot.try_begin_writing();
        slot.publish(1);
        assert!(slot.acquire_reference());
        assert!(!slot.try_begin_writing());
    }

    #[test]
    fn underflow_is_reported_not_panicked() {
        let slot = EventSlot::new();
        assert!(slot.release_reference().is_err());
    }

    #[test]
    fn multiple_readers_must_all_release_before_reuse() {
        let slot = EventSlot::new();
        slot.try_begin_writing();
        slot.publish(5);
        assert!(slot.acquire_reference());
        assert!(slot.acquire_reference());
        assert!(!slot.try_begin_writing());
        slot.release_reference().unwrap();
        assert!(!slot.try_begin_writing());
        slot.release_reference().unwrap();
        assert!(slot.try_begin_writing());
    }
}
