// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File-lock based partial-restart handshake (spec §4.6).
//!
//! Two marker files per service instance coordinate skeleton/proxy
//! lifecycle across crashes:
//!
//! - `existence-<sid>-<iid>`: held EXCLUSIVE by the live skeleton for its
//!   entire offering. A second skeleton cannot acquire it, so duplicate
//!   offerings are rejected outright.
//! - `usage-<sid>-<iid>`: held SHARED by every attached proxy, and
//!   EXCLUSIVE by the skeleton only while it is the sole participant
//!   (used to detect "no live proxies" at create/stop-offer time).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Bounded retry parameters for the narrow window in which the
/// skeleton's create-path holds the usage marker exclusively.
const SHARED_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);
const SHARED_LOCK_RETRY_BUDGET: Duration = Duration::from_millis(250);

/// An open, locked marker file. Dropping it releases the lock by closing
/// the fd.
pub struct MarkerLock {
    _file: File,
}

fn open_marker(dir: &Path, name: &str) -> Result<File> {
    std::fs::create_dir_all(dir).map_err(Error::Lock)?;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(dir.join(name))
        .map_err(Error::Lock)
}

fn try_flock(file: &File, exclusive: bool) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let op = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    } | libc::LOCK_NB;

    // SAFETY: file.as_raw_fd() is a valid fd for the lifetime of this call;
    // flock with LOCK_NB never blocks and its only side effect is the
    // advisory lock state associated with the fd.
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret == 0 {
        Ok(true)
    } else {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

/// Acquire the existence marker exclusively. Failure means another
/// skeleton is already alive for this instance.
pub fn acquire_existence_marker(dir: &Path, file_name: &str) -> Result<MarkerLock> {
    let file = open_marker(dir, file_name)?;
    match try_flock(&file, true).map_err(Error::Lock)? {
        true => Ok(MarkerLock { _file: file }),
        false => Err(Error::BindingFailure(
            "another skeleton already holds the existence marker".into(),
        )),
    }
}

/// Outcome of a skeleton's non-blocking attempt to exclusively lock the
/// usage marker during `PrepareOffer`/`PrepareStopOffer`.
pub enum UsageMarkerOutcome {
    /// No other participant is attached; caller may create fresh
    /// segments (offer) or remove them (stop-offer).
    SoleParticipant(MarkerLock),
    /// Proxies are already attached from a prior incarnation; caller
    /// must open existing segments rather than create new ones (offer),
    /// or leave segments in place (stop-offer).
    ProxiesAttached,
}

pub fn try_exclusive_usage_marker(dir: &Path, file_name: &str) -> Result<UsageMarkerOutcome> {
    let file = open_marker(dir, file_name)?;
    if try_flock(&file, true).map_err(Error::Lock)? {
        Ok(UsageMarkerOutcome::SoleParticipant(MarkerLock { _file: file }))
    } else {
        Ok(UsageMarkerOutcome::ProxiesAttached)
    }
}

/// A proxy's shared lock on the usage marker, acquired with bounded
/// retry to ride out the skeleton's brief exclusive hold during segment
/// creation.
pub fn acquire_shared_usage_marker(dir: &Path, file_name: &str) -> Result<MarkerLock> {
    let file = open_marker(dir, file_name)?;
    let deadline = Instant::now() + SHARED_LOCK_RETRY_BUDGET;
    loop {
        if try_flock(&file, false).map_err(Error::Lock)? {
            return Ok(MarkerLock { _file: file });
        }
        if Instant::now() >= deadline {
            return Err(Error::BindingFailure(
                "timed out waiting for shared usage-marker lock".into(),
            ));
        }
        std::thread::sleep(SHARED_LOCK_RETRY_INTERVAL);
    }
}

#[must_use]
pub fn default_marker_dir() -> PathBuf {
    std::env::temp_dir().join("lola").join("partial_restart")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn existence_marker_rejects_second_skeleton() {
        let dir = tempdir().unwrap();
        let first = acquire_existence_marker(dir.path(), "existence-1-1").unwrap();
        let second = acquire_existence_marker(dir.path(), "existence-1-1");
        assert!(second.is_err());
        drop(first);
        // after release, a new skeleton may acquire it
        assert!(acquire_existence_marker(dir.path(), "existence-1-1").is_ok());
    }

    #[test]
    fn usage_marker_detects_sole_participant() {
        let dir = tempdir().unwrap();
        match try_exclusive_usage_marker(dir.path(), "usage-1-1").unwrap() {
            UsageMarkerOutcome::SoleParticipant(_lock) => {}
            UsageMarkerOutcome::ProxiesAttached => panic!("expected sole participant"),
        }
    }

    #[test]
    fn proxy_shared_lock_blocks_skeleton_exclusive_cleanup() {
        let dir = tempdir().unwrap();
        let proxy_lock = acquire_shared_usage_marker(dir.path(), "usage-2-2").unwrap();
        match try_exclusive_usage_marker(dir.path(), "usage-2-2").unwrap() {
            UsageMarkerOutcome::ProxiesAttached => {}
            UsageMarkerOutcome::SoleParticipant(_) => {
                panic!("skeleton should not see itself as sole participant")
            }
        }
        drop(proxy_lock);
    }
}
