// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The message-passing service (spec §4.10): small out-of-band control
//! messages that ride alongside the shared-memory data path — event
//! notifications, (un)subscribe acknowledgements, outdated-PID cleanup,
//! and method-call/subscribe signalling.
//!
//! A process that participates in both quality levels runs two
//! independent [`MessageReceiver`]s side by side, one per port, each with
//! its own worker pool and its own [`SubscriberRegistry`]. Nothing is
//! shared between them; that is the whole point of the isolation.

mod message;
mod receiver;
mod registry;

pub use message::{Message, ProxyMethodInstanceIdentifier};
pub use receiver::{MessageReceiver, StopToken};
pub use registry::SubscriberRegistry;

use crate::naming::Quality;

/// Both halves of a process's message-passing service: one receiver and
/// one subscriber registry per quality level the process participates
/// in.
pub struct MessagingService {
    pub qm: QualityChannel,
    pub asil_b: Option<QualityChannel>,
}

/// One quality level's receiver paired with the registry its handler
/// closure consults to decide who to notify.
pub struct QualityChannel {
    pub receiver: MessageReceiver,
    pub registry: std::sync::Arc<SubscriberRegistry>,
}

impl QualityChannel {
    #[must_use]
    pub fn spawn(quality: Quality, worker_count: usize, capacity: usize) -> Self {
        let registry = std::sync::Arc::new(SubscriberRegistry::new());
        let handler_registry = std::sync::Arc::clone(&registry);
        let receiver = MessageReceiver::spawn(quality, worker_count, capacity, move |msg| {
            dispatch(&handler_registry, msg);
        });
        Self { receiver, registry }
    }
}

impl MessagingService {
    #[must_use]
    pub fn new(worker_count: usize, capacity: usize, needs_asil_b: bool) -> Self {
        Self {
            qm: QualityChannel::spawn(Quality::Qm, worker_count, capacity),
            asil_b: needs_asil_b
                .then(|| QualityChannel::spawn(Quality::AsilB, worker_count, capacity)),
        }
    }
}

/// Apply a received message's effect to the registry backing its
/// quality level. `NotifyEvent` is a no-op here: actual delivery is the
/// caller's responsibility (it needs the subscriber list, which this
/// function only maintains); this just updates bookkeeping messages.
fn dispatch(registry: &SubscriberRegistry, msg: Message) {
    match msg {
        Message::NotifyEvent(_) => {}
        Message::RegisterEventNotification {
            fq_id,
            subscriber_pid,
        }
        | Message::ReregisterEventNotification {
            fq_id,
            subscriber_pid,
        } => registry.register(fq_id, subscriber_pid),
        Message::UnregisterEventNotification {
            fq_id,
            subscriber_pid,
        } => registry.unregister(fq_id, subscriber_pid),
        Message::NotifyOutdatedNodeId { old_pid, .. } => {
            registry.remove_pid_everywhere(old_pid);
        }
        Message::SubscribeServiceMethod { .. } | Message::CallMethod { .. } => {}
    }
}
