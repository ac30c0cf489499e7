// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-event control structures: the slot-allocation state machine
//! ([`EventDataControl`]) and the subscriber bookkeeping
//! ([`EventSubscriptionControl`]), composed into one [`EventControl`] per
//! registered event/field.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::shm::event_slot::EventSlot;
use crate::shm::txlog::{TransactionLogId, TransactionLogSet};
use crate::shm::SLOT_ALLOCATION_RETRIES;

/// A token returned by [`EventDataControl::allocate_next_slot`],
/// carrying the chosen slot index. Holding this token does not itself
/// grant any reference — it only proves the caller currently owns the
/// WRITING state for that slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotToken {
    pub index: usize,
}

/// Bounded ring of [`EventSlot`]s plus the per-participant transaction
/// log set used to roll back a crashed writer or reader.
pub struct EventDataControl {
    slots: Vec<EventSlot>,
    pub transaction_logs: TransactionLogSet,
}

impl EventDataControl {
    #[must_use]
    pub fn new(number_of_slots: usize, max_subscribers: usize) -> Self {
        Self {
            slots: (0..number_of_slots).map(|_| EventSlot::new()).collect(),
            transaction_logs: TransactionLogSet::new(max_subscribers, number_of_slots),
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> &EventSlot {
        &self.slots[index]
    }

    /// Choose the oldest eligible slot (FREE, or READY with refcount
    /// zero) and CAS it to WRITING, ties broken by lowest index. Records
    /// a skeleton-tracing reference-transaction BEGIN for the chosen
    /// slot before returning, per spec §4.2 step 4.
    pub fn allocate_next_slot(&self) -> Result<SlotToken> {
        for _ in 0..SLOT_ALLOCATION_RETRIES {
            let Some(index) = self.pick_eligible_index() else {
                continue;
            };
            if self.slots[index].try_begin_writing() {
                let node = self.transaction_logs.skeleton_node();
                if !node.is_active() {
                    node.register(0);
                }
                node.log
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .begin_reference(index);
                return Ok(SlotToken { index });
            }
        }
        Err(Error::NoSlotAvailable)
    }

    fn pick_eligible_index(&self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            use crate::shm::event_slot::SlotState;
            let state = slot.state();
            let eligible = state == SlotState::Free
                || (state == SlotState::Ready
                    && slot.refcount.load(Ordering::Acquire) == 0);
            if !eligible {
                continue;
            }
            let ts = slot.timestamp.load(Ordering::Relaxed);
            match best {
                None => best = Some((i, ts)),
                Some((_, best_ts)) if ts < best_ts => best = Some((i, ts)),
                _ => {}
            }
        }
        best.map(|(i, _)| i)
    }

    /// Publish the previously allocated slot: release-store READY, then
    /// record the END of the skeleton-tracing transaction.
    pub fn publish(&self, token: SlotToken, timestamp: u64) {
        self.slots[token.index].publish(timestamp);
        self.transaction_logs
            .skeleton_node()
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .end_reference(token.index);
    }

    /// Reader-side `Receive`: record BEGIN, bump refcount, and leave the
    /// transaction dangling until the matching `release` records END. A
    /// crash between the two calls is exactly what the rollback executor
    /// must find and compensate for, so the bracket spans the whole
    /// holding period, not just this call.
    pub fn receive(&self, slot_index: usize, log_id: TransactionLogId) -> Result<bool> {
        let node = self
            .transaction_logs
            .get_or_register_proxy(log_id)
            .ok_or(Error::NoSlotAvailable)?;
        {
            let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
            log.begin_reference(slot_index);
        }
        let acquired = self.slots[slot_index].acquire_reference();
        if !acquired {
            let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
            log.reference_slots[slot_index].clear();
        }
        Ok(acquired)
    }

    /// Reader-side `Release`: ends the bracket its matching `receive`
    /// opened on `slot_index`, rather than recording an independent
    /// begin/end pair of its own.
    pub fn release(&self, slot_index: usize, log_id: TransactionLogId) -> Result<()> {
        let node = self
            .transaction_logs
            .get_or_register_proxy(log_id)
            .ok_or(Error::NoSlotAvailable)?;
        self.slots[slot_index]
            .release_reference()
            .map_err(|()| Error::Corruption("refcount underflow".into()))?;
        {
            let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
            log.end_reference(slot_index);
        }
        Ok(())
    }
}

/// Packed `{subscriber_count: u16, chosen_max_samples: u16}` atomic, CAS
/// updated on subscribe/unsubscribe.
pub struct EventSubscriptionControl {
    packed: AtomicU32,
    enforce_max_samples: bool,
}

impl EventSubscriptionControl {
    #[must_use]
    pub fn new(enforce_max_samples: bool) -> Self {
        Self {
            packed: AtomicU32::new(0),
            enforce_max_samples,
        }
    }

    fn pack(subscriber_count: u16, chosen_max_samples: u16) -> u32 {
        (u32::from(subscriber_count) << 16) | u32::from(chosen_max_samples)
    }

    fn unpack(v: u32) -> (u16, u16) {
        ((v >> 16) as u16, v as u16)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> u16 {
        Self::unpack(self.packed.load(Ordering::Acquire)).0
    }

    #[must_use]
    pub fn chosen_max_samples(&self) -> u16 {
        Self::unpack(self.packed.load(Ordering::Acquire)).1
    }

    /// CAS loop implementing `new_sub = {count+1, max(chosen, requested)}`.
    /// Refused if `enforce_max_samples` is set, the subscriber raises the
    /// ceiling above `chosen`, and at least one subscriber already
    /// exists.
    pub fn subscribe(&self, requested_max_samples: u16) -> Result<()> {
        loop {
            let current = self.packed.load(Ordering::Acquire);
            let (count, chosen) = Self::unpack(current);

            if self.enforce_max_samples && count > 0 && requested_max_samples > chosen {
                return Err(Error::BindingFailure(
                    "subscriber requested more samples than the enforced ceiling".into(),
                ));
            }

            let new_chosen = chosen.max(requested_max_samples);
            let new_count = count
                .checked_add(1)
                .ok_or_else(|| Error::BindingFailure("subscriber count overflow".into()))?;
            let next = Self::pack(new_count, new_chosen);

            if self
                .packed
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// CAS decrement of `subscriber_count`. Per spec §4.3,
    /// `chosen_max_samples` never shrinks here — only a full quiescence
    /// protocol (not specified) could reset it, and none exists in this
    /// implementation (see DESIGN.md open-question decisions).
    pub fn unsubscribe(&self) -> Result<()> {
        loop {
            let current = self.packed.load(Ordering::Acquire);
            let (count, chosen) = Self::unpack(current);
            if count == 0 {
                return Err(Error::Corruption("unsubscribe with zero subscribers".into()));
            }
            let next = Self::pack(count - 1, chosen);
            if self
                .packed
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

/// One registered event/field: its slot ring plus subscriber
/// bookkeeping.
pub struct EventControl {
    pub data_control: EventDataControl,
    pub subscription_control: EventSubscriptionControl,
}

impl EventControl {
    #[must_use]
    pub fn new(
        number_of_slots: usize,
        max_subscribers: usize,
        enforce_max_samples: bool,
    ) -> Self {
        Self {
            data_control: EventDataControl::new(number_of_slots, max_subscribers),
            subscription_control: EventSubscriptionControl::new(enforce_max_samples),
        }
    }

    /// Subscribe, bracketing the call with a BEGIN/END recorded in the
    /// caller's transaction log so a crash between the CAS and the
    /// caller's own bookkeeping leaves a dangling subscribe-transaction
    /// for rollback to unwind (spec §4.3).
    pub fn subscribe(&self, log_id: TransactionLogId, requested_max_samples: u16) -> Result<()> {
        let node = self
            .data_control
            .transaction_logs
            .get_or_register_proxy(log_id)
            .ok_or(Error::NoSlotAvailable)?;
        {
            let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
            log.begin_subscribe(requested_max_samples);
        }
        let result = self.subscription_control.subscribe(requested_max_samples);
        if result.is_err() {
            let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
            log.subscribe_slot.clear();
        } else {
            let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
            log.end_subscribe();
        }
        result
    }

    /// Unsubscribe, ending the bracket `subscribe` left open.
    pub fn unsubscribe(&self, log_id: TransactionLogId) -> Result<()> {
        let node = self
            .data_control
            .transaction_logs
            .get_or_register_proxy(log_id)
            .ok_or(Error::NoSlotAvailable)?;
        self.subscription_control.unsubscribe()?;
        let mut log = node.log.lock().unwrap_or_else(|e| e.into_inner());
        log.subscribe_slot.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_publish_receive_release_round_trip() {
        let ctl = EventDataControl::new(4, 2);
        let token = ctl.allocate_next_slot().unwrap();
        ctl.publish(token, 1);
        assert!(ctl.receive(token.index, 100).unwrap());
        ctl.release(token.index, 100).unwrap();
        assert_eq!(ctl.slot(token.index).refcount.load(Ordering::Acquire), 0);
    }

    #[test]
    fn allocator_reuses_oldest_ready_slot() {
        let ctl = EventDataControl::new(2, 1);
        let t1 = ctl.allocate_next_slot().unwrap();
        ctl.publish(t1, 1);
        let t2 = ctl.allocate_next_slot().unwrap();
        ctl.publish(t2, 2);
        // both slots are now READY with refcount 0; next allocation must
        // pick the oldest (t1, timestamp 1)
        let t3 = ctl.allocate_next_slot().unwrap();
        assert_eq!(t3.index, t1.index);
    }

    #[test]
    fn no_slot_available_when_all_referenced() {
        let ctl = EventDataControl::new(1, 1);
        let t1 = ctl.allocate_next_slot().unwrap();
        ctl.publish(t1, 1);
        ctl.receive(t1.index, 1).unwrap();
        assert!(matches!(
            ctl.allocate_next_slot(),
            Err(Error::NoSlotAvailable)
        ));
    }

    #[test]
    fn subscription_tracks_max_and_never_shrinks() {
        let sub = EventSubscriptionControl::new(false);
        sub.subscribe(2).unwrap();
        sub.subscribe(5).unwrap();
        assert_eq!(sub.subscriber_count(), 2);
        assert_eq!(sub.chosen_max_samples(), 5);
        sub.unsubscribe().unwrap();
        assert_eq!(sub.subscriber_count(), 1);
        assert_eq!(sub.chosen_max_samples(), 5);
    }

    #[test]
    fn enforced_ceiling_refuses_growth() {
        let sub = EventSubscriptionControl::new(true);
        sub.subscribe(2).unwrap();
        assert!(sub.subscribe(5).is_err());
        assert!(sub.subscribe(2).is_ok());
    }
}
