// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-layout messages exchanged by the message-passing service.

use crate::element_id::ElementFqId;

/// Identifies a proxy-side method binding for `CallMethod`/
/// `SubscribeServiceMethod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyMethodInstanceIdentifier {
    pub proxy_instance_id: u32,
    pub method_id: u16,
}

/// Out-of-band notification/control message. Short and fixed-size so it
/// fits in one message-passing send without fragmentation.
#[derive(Debug, Clone, Copy)]
pub enum Message {
    /// Broadcast to every PID registered for `fq_id`.
    NotifyEvent(ElementFqId),

    /// `target_pid` should remember that `subscriber_pid` wants
    /// notifications for `fq_id`.
    RegisterEventNotification {
        fq_id: ElementFqId,
        subscriber_pid: i32,
    },

    /// Re-assert an existing registration (e.g. after the registry
    /// was rebuilt).
    ReregisterEventNotification {
        fq_id: ElementFqId,
        subscriber_pid: i32,
    },

    /// `subscriber_pid` no longer wants notifications for `fq_id`.
    UnregisterEventNotification {
        fq_id: ElementFqId,
        subscriber_pid: i32,
    },

    /// The provider should remove any state keyed on `old_pid`; best
    /// effort, treated idempotently by the receiver.
    NotifyOutdatedNodeId { old_pid: i32, target_pid: i32 },

    /// Proxy announces it wants to call methods on this service
    /// instance.
    SubscribeServiceMethod {
        id: ProxyMethodInstanceIdentifier,
        proxy_pid: i32,
    },

    /// Proxy invokes a method call previously staged at `position` in
    /// the method's in-args queue.
    CallMethod {
        id: ProxyMethodInstanceIdentifier,
        position: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element_id::Kind;

    #[test]
    fn message_variants_are_copy() {
        let id = ElementFqId::new(1, 2, 3, Kind::Event);
        let msg = Message::NotifyEvent(id);
        let copied = msg;
        assert!(matches!(copied, Message::NotifyEvent(_)));
    }
}
