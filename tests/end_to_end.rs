// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Literal end-to-end scenarios.
//!
//! These exercise the public control/storage/binding/messaging surfaces
//! together, the way a skeleton/proxy pair would use them, without
//! involving a real second process (that is what the per-module unit
//! tests already cover piecewise).

use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lola_shm::config::AsilLevel;
use lola_shm::element_id::{ElementFqId, Kind};
use lola_shm::shm::control::EventControl;
use lola_shm::shm::storage::EventDataStorage;
use lola_shm::shm::txlog::{rollback_transaction_logs, RollbackCallbacks};
use lola_shm::shm::uid_pid::UidPidMapping;
use lola_shm::shm::Skeleton;
use lola_shm::{Message, MessagingService};

/// Scenario 1: basic publish/receive.
///
/// `ElementFqId{service=0x1234, element=5, instance=3, EVENT}`, 4 slots,
/// 2 subscribers; proxy subscribes with `max_samples=2`; skeleton
/// publishes `10, 20, 30`; proxy receives them in order; refcounts
/// return to zero after release.
#[test]
fn basic_publish_receive() {
    let _id = ElementFqId::new(0x1234, 5, 3, Kind::Event);
    let control = EventControl::new(4, 2, false);
    let storage: EventDataStorage<u32> = EventDataStorage::new(4);

    control.subscription_control.subscribe(2).unwrap();

    let mut received = Vec::new();
    for (i, value) in [10u32, 20, 30].into_iter().enumerate() {
        let token = control.data_control.allocate_next_slot().unwrap();
        // SAFETY: sole writer for this index, proven by holding the
        // WRITING token just returned.
        unsafe { *storage.get_mut(token.index) = value };
        control.data_control.publish(token, i as u64);

        assert!(control.data_control.receive(token.index, 1).unwrap());
        // SAFETY: reference acquired by `receive` above.
        received.push(unsafe { *storage.get(token.index) });
        control.data_control.release(token.index, 1).unwrap();
        assert_eq!(
            control.data_control.slot(token.index).refcount.load(Ordering::Acquire),
            0
        );
    }

    assert_eq!(received, vec![10, 20, 30]);
}

/// Scenario 2: slot wrap. 2 slots, 1 subscriber, publish 5 values; the
/// allocator must reuse the oldest READY-refcount-0 slot each time and
/// deliver all 5 in order.
#[test]
fn slot_wrap_reuses_oldest_slot() {
    let control = EventControl::new(2, 1, false);
    let storage: EventDataStorage<u32> = EventDataStorage::new(2);
    control.subscription_control.subscribe(1).unwrap();

    let mut received = Vec::new();
    for (i, value) in [1u32, 2, 3, 4, 5].into_iter().enumerate() {
        let token = control.data_control.allocate_next_slot().unwrap();
        unsafe { *storage.get_mut(token.index) = value };
        control.data_control.publish(token, i as u64);
        control.data_control.receive(token.index, 1).unwrap();
        received.push(unsafe { *storage.get(token.index) });
        control.data_control.release(token.index, 1).unwrap();
    }

    assert_eq!(received, vec![1, 2, 3, 4, 5]);
}

/// Scenario 3: proxy crash rollback. Subscribe, reference two slots,
/// then "crash" (drop without releasing or ending the subscribe
/// transaction). The rollback executor must restore both refcounts to
/// zero and unsubscribe.
#[test]
fn proxy_crash_rollback_restores_refcount_and_subscription() {
    let control = EventControl::new(4, 2, false);
    control.subscription_control.subscribe(1).unwrap();

    let t1 = control.data_control.allocate_next_slot().unwrap();
    control.data_control.publish(t1, 1);
    let t2 = control.data_control.allocate_next_slot().unwrap();
    control.data_control.publish(t2, 2);

    let log_id = 42;
    control.data_control.receive(t1.index, log_id).unwrap();
    control.data_control.receive(t2.index, log_id).unwrap();
    // crash: proxy dies here, no release, no end_subscribe recorded
    // against its own log (subscribe transaction is tracked separately
    // in a real binding; here we model only the dangling references).

    let dereferenced = RefCell::new(Vec::new());
    let callbacks = RollbackCallbacks {
        dereference: &|index| {
            control.data_control.release(index, log_id)?;
            dereferenced.borrow_mut().push(index);
            Ok(())
        },
        unsubscribe: &|_max| control.subscription_control.unsubscribe(),
    };

    rollback_transaction_logs(&control.data_control.transaction_logs, log_id, &callbacks)
        .unwrap();

    let mut rolled_back = dereferenced.into_inner();
    rolled_back.sort_unstable();
    assert_eq!(rolled_back, vec![t1.index, t2.index]);
    assert_eq!(
        control.data_control.slot(t1.index).refcount.load(Ordering::Acquire),
        0
    );
    assert_eq!(
        control.data_control.slot(t2.index).refcount.load(Ordering::Acquire),
        0
    );
}

/// Scenario 4: outdated PID notification. A proxy with UID 42 first
/// registers as PID 1, then restarts as PID 2; `UidPidMapping` must
/// return the old PID so the caller can emit exactly one
/// `NotifyOutdatedNodeId`.
#[test]
fn outdated_pid_notification_fires_exactly_once() {
    let mapping = UidPidMapping::with_default_capacity();
    let previous = mapping.register(42, 1).unwrap();
    assert_eq!(previous, 0);

    let previous_on_restart = mapping.register(42, 2).unwrap();
    assert_eq!(previous_on_restart, 1);
    assert_eq!(mapping.lookup(42), Some(2));

    let service = MessagingService::new(1, 8, false);
    service
        .qm
        .receiver
        .send(Message::NotifyOutdatedNodeId {
            old_pid: previous_on_restart,
            target_pid: 999,
        })
        .unwrap();

    // registering old_pid as a subscriber first makes the effect of the
    // notification observable: it must be purged from every element.
    let fq_id = ElementFqId::new(1, 1, 1, Kind::Event);
    service.qm.registry.register(fq_id, previous_on_restart);
    std::thread::sleep(Duration::from_millis(100));
    assert!(service.qm.registry.copy_subscriber_pids(fq_id).is_empty());
}

/// Scenario 5: duplicate offer refused. Skeleton A holds the existence
/// marker exclusively; skeleton B's `prepare_offer` for the same
/// instance must fail without touching segments.
#[test]
fn duplicate_offer_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let service_id = 7;
    let instance_id = 7;

    let _skeleton_a = Skeleton::prepare_offer(
        service_id,
        instance_id,
        AsilLevel::Qm,
        8,
        dir.path().to_path_buf(),
    )
    .unwrap();

    let skeleton_b = Skeleton::prepare_offer(
        service_id,
        instance_id,
        AsilLevel::Qm,
        8,
        dir.path().to_path_buf(),
    );
    assert!(skeleton_b.is_err());
}

/// Scenario 6: two-thread liveness. A QM handler sleeps indefinitely; an
/// ASIL-B handler keeps counting. Publishing to both every 50ms for a
/// shortened test window must still deliver at least 90% of the
/// expected ASIL-B count.
#[test]
fn qm_saturation_does_not_delay_asil_b() {
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter_clone = std::sync::Arc::clone(&counter);

    let qm = lola_shm::MessageReceiver::spawn(lola_shm::Quality::Qm, 1, 64, |_msg| {
        std::thread::sleep(Duration::from_secs(3600));
    });
    let asil_b = lola_shm::MessageReceiver::spawn(lola_shm::Quality::AsilB, 1, 64, move |_msg| {
        counter_clone.fetch_add(1, Ordering::Relaxed);
    });

    let fq_id = ElementFqId::new(2, 2, 2, Kind::Event);
    // scaled down from the spec's 50ms/10s/200 for test speed, same 90%
    // threshold
    let expected_publishes = 20;
    for _ in 0..expected_publishes {
        qm.send(Message::NotifyEvent(fq_id)).ok();
        asil_b.send(Message::NotifyEvent(fq_id)).ok();
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(100));

    let delivered = counter.load(Ordering::Relaxed);
    assert!(
        delivered >= (expected_publishes * 9) / 10,
        "expected at least 90% of {expected_publishes}, got {delivered}"
    );

    qm.stop_token().trigger();
    std::mem::forget(qm);
    asil_b.shutdown();
}
