// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity lock-free UID↔PID table letting a restarted proxy be
//! recognised by the provider as the same logical participant under a
//! new process id.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::config::DEFAULT_UID_PID_CAPACITY;
use crate::error::{Error, Result};

struct Entry {
    uid: AtomicU32,
    pid: AtomicI32,
}

impl Entry {
    fn empty() -> Self {
        Self {
            uid: AtomicU32::new(0),
            pid: AtomicI32::new(0),
        }
    }
}

/// Fixed capacity; default 50 (see DESIGN.md open-question decisions —
/// callers are expected to size this from configuration).
pub struct UidPidMapping {
    entries: Vec<Entry>,
}

impl UidPidMapping {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| Entry::empty()).collect(),
        }
    }

    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_UID_PID_CAPACITY)
    }

    /// Register `(uid, pid)`. If `uid` is already present, atomically
    /// exchanges its pid and returns the previous value (0 = never seen
    /// alive under this registration). Otherwise claims the first empty
    /// slot. Returns `Err` on exhaustion.
    pub fn register(&self, uid: u32, pid: i32) -> Result<i32> {
        for entry in &self.entries {
            if entry.uid.load(Ordering::Acquire) == uid {
                return Ok(entry.pid.swap(pid, Ordering::AcqRel));
            }
        }

        for entry in &self.entries {
            if entry
                .uid
                .compare_exchange(0, uid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry.pid.store(pid, Ordering::Release);
                return Ok(0);
            }
        }

        Err(Error::BindingFailure(
            "UID/PID mapping table exhausted".into(),
        ))
    }

    /// Current pid for `uid`, or `None` if not present (`pid == 0`).
    #[must_use]
    pub fn lookup(&self, uid: u32) -> Option<i32> {
        for entry in &self.entries {
            if entry.uid.load(Ordering::Acquire) == uid {
                let pid = entry.pid.load(Ordering::Acquire);
                return if pid == 0 { None } else { Some(pid) };
            }
        }
        None
    }
}
