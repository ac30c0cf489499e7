// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `lola-shm`: shared-memory pub/sub and request/reply transport core.
//!
//! This crate implements the data-plane primitives a safety-qualified
//! IPC middleware needs to move events, fields, and method calls
//! between processes without copying payloads across a syscall
//! boundary:
//!
//! ```text
//! +-----------+        DATA segment (payloads, one per service)       +-----------+
//! | Skeleton  | <----------------------------------------------------+---------->| Proxy
//! | (provider)|        CONTROL segment (per quality level: QM/ASIL-B)|(consumer) |
//! +-----------+                                                      +-----------+
//!       |                                                                  |
//!       +------------------- message-passing service ---------------------+
//!                    (out-of-band notify/subscribe/call signalling)
//! ```
//!
//! - [`shm`] holds the shared-memory subsystem: segment lifecycle,
//!   lock-free event slots, subscription bookkeeping, transaction logs
//!   for crash rollback, the partial-restart file-lock protocol, and
//!   the skeleton/proxy binding that ties them together.
//! - [`messaging`] holds the two independent, quality-isolated message
//!   receivers used for notifications and method-call signalling.
//! - [`element_id`], [`naming`] and [`config`] are the shared vocabulary
//!   both subsystems build on.
//!
//! ## Quick start
//!
//! ```no_run
//! use lola_shm::config::AsilLevel;
//! use lola_shm::shm::Skeleton;
//!
//! let mut skeleton = Skeleton::prepare_offer(
//!     1,
//!     1,
//!     AsilLevel::Qm,
//!     50,
//!     lola_shm::shm::partial_restart::default_marker_dir(),
//! )?;
//! # Ok::<(), lola_shm::error::Error>(())
//! ```

pub mod config;
pub mod element_id;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod naming;
pub mod offset_ptr;
pub mod shm;

pub use config::{AsilLevel, QualityAllowlist, ServiceElementConfig, ShmSizeCalculationMode};
pub use element_id::{ElementFqId, Kind as ElementKind};
pub use error::{Error, Result};
pub use messaging::{Message, MessageReceiver, MessagingService, SubscriberRegistry};
pub use naming::Quality;
pub use shm::{Proxy, Skeleton};
