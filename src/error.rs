// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds named by the transport core: construction
//! failures return an invalid handle to the caller, transient
//! message-passing failures propagate, and invariant violations are
//! treated as fatal by callers (see [`Error::is_fatal`]).

use std::fmt;
use std::io;

/// Errors surfaced by the shared-memory transport core.
#[derive(Debug)]
pub enum Error {
    /// Segment or control structure could not be created or opened, or a
    /// mandatory invariant was not met during binding.
    BindingFailure(String),

    /// `AllocateNextSlot` exhausted its bounded retry count.
    NoSlotAvailable,

    /// No free position in a method's type-erased call queue.
    CallQueueFull,

    /// The targeted service instance has no live skeleton.
    ServiceNotOffered,

    /// Message-passing send or receive failed.
    CommunicationLinkError(String),

    /// `find_service` handler registration or invocation failed.
    FindServiceHandlerFailure(String),

    /// A handle (proxy/skeleton/subscription token) was used after being
    /// invalidated or was never valid.
    InvalidHandle,

    /// Rollback could not complete; a dangling transaction remains marked
    /// `needs_rollback`. The caller must reject the open and let the
    /// operator restart.
    CouldNotRestartProxy,

    /// Shared memory segment creation failed.
    SegmentCreate(io::Error),

    /// Shared memory segment open failed.
    SegmentOpen(io::Error),

    /// Memory mapping failed.
    Mmap(io::Error),

    /// Invalid segment or marker-file name.
    InvalidName(String),

    /// Segment not found.
    NotFound(String),

    /// Data corruption detected (bad magic, refcount underflow, dangling
    /// slot invariant broken). Always fatal.
    Corruption(String),

    /// A file-lock operation failed for a reason other than "already
    /// held" (which is modeled as `Ok(false)` by the lock helpers, not an
    /// error).
    Lock(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindingFailure(msg) => write!(f, "binding failure: {msg}"),
            Self::NoSlotAvailable => write!(f, "no slot available"),
            Self::CallQueueFull => write!(f, "call queue full"),
            Self::ServiceNotOffered => write!(f, "service not offered"),
            Self::CommunicationLinkError(msg) => write!(f, "communication link error: {msg}"),
            Self::FindServiceHandlerFailure(msg) => {
                write!(f, "find-service handler failure: {msg}")
            }
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::CouldNotRestartProxy => write!(f, "could not restart proxy"),
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
            Self::Corruption(msg) => write!(f, "data corruption detected: {msg}"),
            Self::Lock(e) => write!(f, "file lock operation failed: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) | Self::Lock(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

impl Error {
    /// Invariant violations are fatal per the error handling design: log
    /// and terminate rather than continue with a shared-memory invariant
    /// broken.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_fatal() {
        assert!(Error::Corruption("bad magic".into()).is_fatal());
        assert!(!Error::NoSlotAvailable.is_fatal());
    }

    #[test]
    fn display_is_human_readable() {
        let err = Error::BindingFailure("segment missing".into());
        assert_eq!(err.to_string(), "binding failure: segment missing");
    }
}
