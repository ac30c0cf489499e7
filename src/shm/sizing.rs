// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory segment sizing.
//!
//! The skeleton must create each segment with its exact final size —
//! shared memory segments cannot grow after creation without a full
//! re-create-and-migrate, which this core does not support (dynamic
//! reconfiguration is an explicit non-goal). Two strategies are offered,
//! selected by configuration:
//!
//! - [`SizingMode::Estimate`]: closed-form formulas over the registered
//!   elements, fast and slightly conservative.
//! - [`SizingMode::Simulate`]: allocate against a heap-backed resource
//!   with identical allocator semantics and measure bytes actually used.

use crate::config::ServiceElementConfig;
use crate::offset_ptr::BumpAllocator;
use crate::shm::event_slot::EventSlot;

/// How a skeleton computes segment sizes at offer time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    Simulate,
    Estimate,
}

/// Conservative estimate of one event's CONTROL-segment footprint:
/// `EventControl` (ring of `EventSlot` + transaction log set) plus
/// subscription control.
#[must_use]
pub fn estimate_event_control_size(cfg: &ServiceElementConfig) -> usize {
    let slot_size = std::mem::size_of::<EventSlot>();
    let ring = slot_size * cfg.number_of_slots as usize;
    // One TransactionLog per proxy slot plus the skeleton-tracing slot;
    // each holds one TransactionLogSlot per ring position plus a
    // subscribe slot. Rough but conservative: 2 bools per ring position.
    let log_set = (cfg.max_subscribers as usize + 1)
        * (cfg.number_of_slots as usize * 2 + 3);
    let subscription_control = std::mem::size_of::<u32>();
    ring + log_set + subscription_control
}

/// Conservative estimate of one event's DATA-segment footprint for a
/// sample of size `sample_size` (payload array plus one `EventMetaInfo`
/// entry).
#[must_use]
pub fn estimate_event_data_size(cfg: &ServiceElementConfig, sample_size: usize) -> usize {
    sample_size * cfg.number_of_slots as usize + 64
}

/// Sum of [`estimate_event_control_size`]/[`estimate_event_data_size`]
/// over every registered element, used directly when `mode ==
/// Estimate`, or compared against the simulated measurement when `mode
/// == Simulate` (the caller picks the larger of the two as a safety
/// margin, matching the "conservative upper-bound" language of spec
/// §4.7).
#[must_use]
pub fn estimate_total(
    elements: &[(ServiceElementConfig, usize)],
) -> (usize, usize) {
    let mut control_total = 0;
    let mut data_total = 0;
    for (cfg, sample_size) in elements {
        control_total += estimate_event_control_size(cfg);
        data_total += estimate_event_data_size(cfg, *sample_size);
    }
    (control_total, data_total)
}

/// Measures actual bytes used by allocating each element's structures
/// against a scratch heap-backed resource with the same allocator
/// semantics the real segment will use.
#[must_use]
pub fn simulate_total(elements: &[(ServiceElementConfig, usize)]) -> (usize, usize) {
    // Allocate generously-sized scratch buffers; the bump allocator will
    // report exactly how much of each it actually used.
    let (est_control, est_data) = estimate_total(elements);
    let mut control_scratch = vec![0u8; est_control.max(64)];
    let mut data_scratch = vec![0u8; est_data.max(64)];

    let control_alloc =
        unsafe { BumpAllocator::new(control_scratch.as_mut_ptr(), control_scratch.len()) };
    let data_alloc = unsafe { BumpAllocator::new(data_scratch.as_mut_ptr(), data_scratch.len()) };

    for (cfg, sample_size) in elements {
        let _ = control_alloc.allocate(
            std::mem::size_of::<EventSlot>() * cfg.number_of_slots as usize,
            64,
        );
        let _ = data_alloc.allocate(sample_size * cfg.number_of_slots as usize, 8);
    }

    (control_alloc.used(), data_alloc.used())
}

/// Compute final segment sizes per the configured [`SizingMode`].
#[must_use]
pub fn compute_sizes(
    mode: SizingMode,
    elements: &[(ServiceElementConfig, usize)],
) -> (usize, usize) {
    match mode {
        SizingMode::Estimate => estimate_total(elements),
        SizingMode::Simulate => simulate_total(elements),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_grows_with_slot_count() {
        let small = ServiceElementConfig::new(2, 1);
        let large = ServiceElementConfig::new(16, 1);
        assert!(estimate_event_control_size(&small) < estimate_event_control_size(&large));
    }

    #[test]
    fn compute_sizes_dispatches_on_mode() {
        let elements = vec![(ServiceElementConfig::new(4, 2), 64)];
        let (est_ctl, est_data) = compute_sizes(SizingMode::Estimate, &elements);
        let (sim_ctl, sim_data) = compute_sizes(SizingMode::Simulate, &elements);
        assert!(est_ctl > 0 && est_data > 0);
        assert!(sim_ctl > 0 && sim_data > 0);
    }
}
