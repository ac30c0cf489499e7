// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Skeleton/proxy binding: creates or opens the DATA and CONTROL
//! segments, registers service elements, and runs the partial-restart
//! handshake.

use std::path::PathBuf;

use dashmap::DashMap;

use crate::config::{AsilLevel, ServiceElementConfig};
use crate::element_id::ElementFqId;
use crate::error::{Error, Result};
use crate::naming::{self, Quality};
use crate::shm::control::EventControl;
use crate::shm::partial_restart::{
    acquire_existence_marker, acquire_shared_usage_marker, try_exclusive_usage_marker, MarkerLock,
    UsageMarkerOutcome,
};
use crate::shm::segment::{cleanup_stale_segments, ShmSegment};
use crate::shm::storage::ServiceDataStorage;
use crate::shm::txlog::{
    rollback_transaction_logs, RollbackCallbacks, RollbackSyncRegistry, TransactionLogId,
};
use crate::shm::uid_pid::UidPidMapping;

/// `{event_controls, uid_pid_mapping}` — the root of a CONTROL segment.
/// `DashMap` gives lock-free-ish concurrent lookup for the common case
/// (many proxies reading, the skeleton occasionally inserting at
/// registration time, never concurrently with steady-state traffic).
pub struct ServiceDataControl {
    pub event_controls: DashMap<ElementFqId, EventControl>,
    pub uid_pid_mapping: UidPidMapping,
}

impl ServiceDataControl {
    #[must_use]
    pub fn new(uid_pid_capacity: usize) -> Self {
        Self {
            event_controls: DashMap::new(),
            uid_pid_mapping: UidPidMapping::new(uid_pid_capacity),
        }
    }
}

/// Provider-side handle: owns segment creation/destruction, element
/// registration and the partial-restart decision at offer time.
pub struct Skeleton {
    pub service_id: u16,
    pub instance_id: u16,
    pub asil_level: AsilLevel,
    pub data_storage: ServiceDataStorage,
    pub control_qm: ServiceDataControl,
    pub control_asil_b: Option<ServiceDataControl>,
    marker_dir: PathBuf,
    _existence_lock: MarkerLock,
    data_segment: Option<ShmSegment>,
    control_qm_segment: Option<ShmSegment>,
    control_asil_b_segment: Option<ShmSegment>,
}

impl Skeleton {
    /// `PrepareOffer` (spec §4.6): acquire the existence marker
    /// exclusively (failing if another skeleton is alive), then inspect
    /// the usage marker to decide between a fresh create and an open of
    /// a surviving partial-restart incarnation.
    pub fn prepare_offer(
        service_id: u16,
        instance_id: u16,
        asil_level: AsilLevel,
        uid_pid_capacity: usize,
        marker_dir: PathBuf,
    ) -> Result<Self> {
        let existence_lock = acquire_existence_marker(
            &marker_dir,
            &naming::existence_marker_name(service_id, instance_id),
        )?;

        let usage_name = naming::usage_marker_name(service_id, instance_id);
        let outcome = try_exclusive_usage_marker(&marker_dir, &usage_name)?;

        let data_name = naming::data_segment_name(service_id, instance_id);
        let qm_name = naming::control_segment_name(service_id, instance_id, 0, Quality::Qm);

        let (data_segment, control_qm_segment, control_asil_b_segment, fresh) = match outcome {
            UsageMarkerOutcome::SoleParticipant(_usage_lock) => {
                cleanup_stale_segments(service_id, instance_id);
                // sizes are placeholders here; real sizing happens in
                // register_event/sizing::compute_sizes before segments
                // are resized via re-create in a full offer sequence.
                let data = ShmSegment::create(&data_name, 4096, true)?;
                let qm = ShmSegment::create(&qm_name, 4096, false)?;
                let asilb = if asil_level == AsilLevel::B {
                    let asilb_name =
                        naming::control_segment_name(service_id, instance_id, 0, Quality::AsilB);
                    Some(ShmSegment::create(&asilb_name, 4096, false)?)
                } else {
                    None
                };
                (Some(data), Some(qm), asilb, true)
            }
            UsageMarkerOutcome::ProxiesAttached => {
                let data = ShmSegment::open(&data_name, 4096)?;
                let qm = ShmSegment::open(&qm_name, 4096)?;
                let asilb = if asil_level == AsilLevel::B {
                    let asilb_name =
                        naming::control_segment_name(service_id, instance_id, 0, Quality::AsilB);
                    Some(ShmSegment::open(&asilb_name, 4096)?)
                } else {
                    None
                };
                (Some(data), Some(qm), asilb, false)
            }
        };

        let data_storage = ServiceDataStorage::new();
        // SAFETY invariant: pid/uid below are placeholders for the
        // process's real identity, supplied by the collaborator layer in
        // a full deployment; this core only defines the two moments at
        // which they are written.
        data_storage.set_skeleton_identity(std::process::id() as i32, 0);

        let skeleton = Self {
            service_id,
            instance_id,
            asil_level,
            data_storage,
            control_qm: ServiceDataControl::new(uid_pid_capacity),
            control_asil_b: if asil_level == AsilLevel::B {
                Some(ServiceDataControl::new(uid_pid_capacity))
            } else {
                None
            },
            marker_dir,
            _existence_lock: existence_lock,
            data_segment,
            control_qm_segment,
            control_asil_b_segment,
        };

        if !fresh {
            skeleton.rollback_skeleton_tracing();
        }

        Ok(skeleton)
    }

    /// `PrepareStopOffer` (spec §4.6): if no proxies remain, remove all
    /// segments and marker files; otherwise leave them in place.
    pub fn prepare_stop_offer(&mut self) -> Result<()> {
        let usage_name = naming::usage_marker_name(self.service_id, self.instance_id);
        match try_exclusive_usage_marker(&self.marker_dir, &usage_name)? {
            UsageMarkerOutcome::SoleParticipant(_lock) => {
                if let Some(seg) = self.data_segment.take() {
                    let name = seg.name().to_string();
                    drop(seg);
                    ShmSegment::unlink(&name)?;
                }
                if let Some(seg) = self.control_qm_segment.take() {
                    let name = seg.name().to_string();
                    drop(seg);
                    ShmSegment::unlink(&name)?;
                }
                if let Some(seg) = self.control_asil_b_segment.take() {
                    let name = seg.name().to_string();
                    drop(seg);
                    ShmSegment::unlink(&name)?;
                }
                Ok(())
            }
            UsageMarkerOutcome::ProxiesAttached => Ok(()),
        }
    }

    /// Register one event/field per spec §4.8. Duplicate registration
    /// under the same id is a binding failure (fatal misuse, not a
    /// recoverable error — per spec, "duplicate registration... is
    /// fatal").
    pub fn register_event(&self, id: ElementFqId, cfg: &ServiceElementConfig) -> Result<()> {
        if self.control_qm.event_controls.contains_key(&id) {
            return Err(Error::BindingFailure(format!(
                "duplicate registration of element {id}"
            )));
        }

        let control = EventControl::new(
            cfg.number_of_slots as usize,
            cfg.max_subscribers as usize,
            cfg.enforce_max_samples,
        );
        self.control_qm.event_controls.insert(id, control);

        if let Some(asil_b) = &self.control_asil_b {
            let dup = EventControl::new(
                cfg.number_of_slots as usize,
                cfg.max_subscribers as usize,
                cfg.enforce_max_samples,
            );
            asil_b.event_controls.insert(id, dup);
        }

        Ok(())
    }

    fn rollback_skeleton_tracing(&self) {
        for quality_control in std::iter::once(&self.control_qm).chain(self.control_asil_b.iter())
        {
            for entry in &quality_control.event_controls {
                let ctl = entry.value();
                let node = ctl.data_control.transaction_logs.skeleton_node();
                if !node.is_active() || !node.needs_rollback() {
                    continue;
                }
                let callbacks = RollbackCallbacks {
                    dereference: &|index| {
                        ctl.data_control
                            .slot(index)
                            .release_reference()
                            .map_err(|()| Error::Corruption("refcount underflow".into()))
                    },
                    unsubscribe: &|_max| Ok(()),
                };
                let _ = rollback_transaction_logs(
                    &ctl.data_control.transaction_logs,
                    0,
                    &callbacks,
                );
            }
        }
    }
}

/// Consumer-side handle: opens existing segments, runs rollback for its
/// own identity, and subscribes.
pub struct Proxy {
    pub service_id: u16,
    pub instance_id: u16,
    pub log_id: TransactionLogId,
    _usage_lock: MarkerLock,
    data_segment: ShmSegment,
    control_qm_segment: ShmSegment,
    control_asil_b_segment: Option<ShmSegment>,
}

impl Proxy {
    /// `Create` (spec §4.6): acquire a shared usage-marker lock with
    /// bounded retry, open the DATA/CONTROL segments, then run
    /// `RollbackTransactionLogs()` for this proxy's identity as part of
    /// construction — not a separate step the caller must remember.
    ///
    /// `rollback_sync` is the per-process rollback-synchronization
    /// registry (step 1: at most once per segment per process); `uid` and
    /// `provider_pid` are registered into each opened control's
    /// `UidPidMapping` (step 2), and `notify_outdated` is invoked with
    /// `(old_pid, provider_pid)` if this uid was already registered under
    /// a different pid.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        service_id: u16,
        instance_id: u16,
        log_id: TransactionLogId,
        uid: u32,
        provider_pid: i32,
        needs_asil_b: bool,
        marker_dir: PathBuf,
        control_qm: &ServiceDataControl,
        control_asil_b: Option<&ServiceDataControl>,
        rollback_sync: &RollbackSyncRegistry,
        notify_outdated: &dyn Fn(i32, i32),
    ) -> Result<Self> {
        let usage_name = naming::usage_marker_name(service_id, instance_id);
        let usage_lock = acquire_shared_usage_marker(&marker_dir, &usage_name)?;

        let data_name = naming::data_segment_name(service_id, instance_id);
        let qm_name = naming::control_segment_name(service_id, instance_id, 0, Quality::Qm);

        let data_segment = ShmSegment::open(&data_name, 4096)?;
        let control_qm_segment = ShmSegment::open(&qm_name, 4096)?;
        let control_asil_b_segment = if needs_asil_b {
            let asilb_name = naming::control_segment_name(service_id, instance_id, 0, Quality::AsilB);
            Some(ShmSegment::open(&asilb_name, 4096)?)
        } else {
            None
        };

        let proxy = Self {
            service_id,
            instance_id,
            log_id,
            _usage_lock: usage_lock,
            data_segment,
            control_qm_segment,
            control_asil_b_segment,
        };

        if rollback_sync.claim_once(proxy.data_segment.as_ptr() as usize) {
            Self::register_identity(control_qm, uid, provider_pid, notify_outdated)?;
            proxy.rollback(control_qm)?;
            if let Some(asil_b) = control_asil_b {
                Self::register_identity(asil_b, uid, provider_pid, notify_outdated)?;
                proxy.rollback(asil_b)?;
            }
        }

        Ok(proxy)
    }

    fn register_identity(
        control: &ServiceDataControl,
        uid: u32,
        provider_pid: i32,
        notify_outdated: &dyn Fn(i32, i32),
    ) -> Result<()> {
        let old_pid = control.uid_pid_mapping.register(uid, provider_pid)?;
        if old_pid != 0 && old_pid != provider_pid {
            notify_outdated(old_pid, provider_pid);
        }
        Ok(())
    }

    /// Roll back any dangling transactions this proxy's prior
    /// incarnation left behind, against the given control's event set.
    pub fn rollback(&self, control: &ServiceDataControl) -> Result<()> {
        for entry in &control.event_controls {
            let ctl = entry.value();
            let callbacks = RollbackCallbacks {
                dereference: &|index| {
                    ctl.data_control
                        .slot(index)
                        .release_reference()
                        .map_err(|()| Error::Corruption("refcount underflow".into()))
                },
                unsubscribe: &|_max| ctl.subscription_control.unsubscribe(),
            };
            rollback_transaction_logs(&ctl.data_control.transaction_logs, self.log_id, &callbacks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn unique_ids() -> (u16, u16) {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        (nanos as u16, (nanos >> 16) as u16)
    }

    #[test]
    fn prepare_offer_then_stop_offer_cleans_up_with_no_proxies() {
        let dir = tempdir().unwrap();
        let (sid, iid) = unique_ids();
        let mut skeleton = Skeleton::prepare_offer(sid, iid, AsilLevel::Qm, 8, dir.path().to_path_buf())
            .expect("prepare_offer failed");

        let cfg = ServiceElementConfig::new(4, 2);
        let id = ElementFqId::new(sid, 1, iid, crate::element_id::Kind::Event);
        skeleton.register_event(id, &cfg).unwrap();
        assert!(skeleton.control_qm.event_controls.contains_key(&id));

        skeleton.prepare_stop_offer().unwrap();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dir = tempdir().unwrap();
        let (sid, iid) = unique_ids();
        let skeleton = Skeleton::prepare_offer(sid, iid, AsilLevel::Qm, 8, dir.path().to_path_buf())
            .expect("prepare_offer failed");

        let cfg = ServiceElementConfig::new(4, 2);
        let id = ElementFqId::new(sid, 1, iid, crate::element_id::Kind::Event);
        skeleton.register_event(id, &cfg).unwrap();
        assert!(skeleton.register_event(id, &cfg).is_err());
    }

    #[test]
    fn proxy_create_rolls_back_dangling_transactions_inline() {
        let dir = tempdir().unwrap();
        let (sid, iid) = unique_ids();
        let skeleton = Skeleton::prepare_offer(sid, iid, AsilLevel::Qm, 8, dir.path().to_path_buf())
            .expect("prepare_offer failed");

        let cfg = ServiceElementConfig::new(4, 2);
        let id = ElementFqId::new(sid, 1, iid, crate::element_id::Kind::Event);
        skeleton.register_event(id, &cfg).unwrap();

        let log_id = 99;
        let slot_index = {
            let ctl = skeleton.control_qm.event_controls.get(&id).unwrap();
            let token = ctl.data_control.allocate_next_slot().unwrap();
            ctl.data_control.publish(token, 1);
            ctl.data_control.receive(token.index, log_id).unwrap();
            // crash: no release recorded, leaving the reference dangling
            token.index
        };

        let sync = RollbackSyncRegistry::new();
        let notified: RefCell<Option<(i32, i32)>> = RefCell::new(None);
        let provider_pid = std::process::id() as i32;
        let proxy = Proxy::create(
            sid,
            iid,
            log_id,
            42,
            provider_pid,
            false,
            dir.path().to_path_buf(),
            &skeleton.control_qm,
            None,
            &sync,
            &|old, new| *notified.borrow_mut() = Some((old, new)),
        )
        .expect("proxy create failed");

        let ctl = skeleton.control_qm.event_controls.get(&id).unwrap();
        assert_eq!(
            ctl.data_control.slot(slot_index).refcount.load(Ordering::Acquire),
            0
        );
        assert_eq!(
            skeleton.control_qm.uid_pid_mapping.lookup(42),
            Some(provider_pid)
        );
        assert!(notified.into_inner().is_none());
        drop(proxy);
    }
}
