// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fully-qualified element identifiers.
//!
//! An [`ElementFqId`] names one event/field/method of one service
//! instance. It has no class invariants to maintain: all four fields are
//! public and trivially copyable, and the type is passed by value
//! everywhere, including into shared memory.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of service element an [`ElementFqId`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Kind {
    #[default]
    Invalid = 0,
    Event = 1,
    Field = 2,
    Method = 3,
}

/// Fully-qualified id of a service element within a service instance.
///
/// Equality, ordering and hashing deliberately ignore `kind`: the other
/// three fields already uniquely identify an element, and the source
/// this is modeled on documents exactly that reasoning for its
/// `operator==`/`operator<`.
#[derive(Debug, Clone, Copy)]
pub struct ElementFqId {
    pub service_id: u16,
    pub element_id: u16,
    pub instance_id: u16,
    pub kind: Kind,
}

impl ElementFqId {
    #[must_use]
    pub const fn new(service_id: u16, element_id: u16, instance_id: u16, kind: Kind) -> Self {
        Self {
            service_id,
            element_id,
            instance_id,
            kind,
        }
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self.kind, Kind::Event)
    }

    #[must_use]
    pub fn is_field(&self) -> bool {
        matches!(self.kind, Kind::Field)
    }

    #[must_use]
    pub fn is_method(&self) -> bool {
        matches!(self.kind, Kind::Method)
    }

    /// 48-bit wire/hash form: `service_id<<32 | element_id<<16 | instance_id`.
    /// `kind` is excluded, matching the equality/hash contract.
    #[must_use]
    pub fn kind_48bit(&self) -> u64 {
        (u64::from(self.service_id) << 32)
            | (u64::from(self.element_id) << 16)
            | u64::from(self.instance_id)
    }
}

impl Default for ElementFqId {
    /// All-ones triple + `Invalid`, matching the source's default
    /// constructor.
    fn default() -> Self {
        Self {
            service_id: u16::MAX,
            element_id: u16::MAX,
            instance_id: u16::MAX,
            kind: Kind::Invalid,
        }
    }
}

impl PartialEq for ElementFqId {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
            && self.element_id == other.element_id
            && self.instance_id == other.instance_id
    }
}
impl Eq for ElementFqId {}

impl PartialOrd for ElementFqId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElementFqId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.service_id, self.element_id, self.instance_id).cmp(&(
            other.service_id,
            other.element_id,
            other.instance_id,
        ))
    }
}

impl Hash for ElementFqId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_48bit().hash(state);
    }
}

impl fmt::Display for ElementFqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.service_id, self.instance_id, self.element_id
        )
    }
}
