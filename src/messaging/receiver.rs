// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process message receivers.
//!
//! Exactly two receivers run per process: one bound to the QM port, one
//! to the ASIL-B port, each with its own dedicated worker thread pool.
//! This isolation is mandatory (spec §4.10): a flood or a stuck handler
//! on the QM channel must never delay ASIL-B delivery, so the two
//! receivers share no queue, no thread, and no lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver as ChanReceiver, Sender};

use crate::messaging::message::Message;
use crate::naming::Quality;

/// Cooperative cancellation token shared by a receiver's worker pool.
#[derive(Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A single quality-level receiver: a bounded channel standing in for
/// the OS message-passing port, drained by `worker_count` dedicated
/// threads.
pub struct MessageReceiver {
    quality: Quality,
    sender: Sender<Message>,
    stop: StopToken,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl MessageReceiver {
    /// Spawn `worker_count` threads, each running `handler` for every
    /// message dequeued until `stop` is triggered.
    pub fn spawn<F>(quality: Quality, worker_count: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (sender, receiver) = bounded(capacity);
        let stop = StopToken::new();
        let handler = Arc::new(handler);

        let workers = (0..worker_count.max(1))
            .map(|_| {
                let receiver: ChanReceiver<Message> = receiver.clone();
                let stop = stop.clone();
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || {
                    while !stop.is_triggered() {
                        match receiver.recv_timeout(std::time::Duration::from_millis(50)) {
                            Ok(msg) => handler(msg),
                            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            quality,
            sender,
            stop,
            workers,
        }
    }

    #[must_use]
    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// Enqueue a message for this receiver's worker pool. Returns an
    /// error (communication-link failure) if the channel is full or the
    /// receiver has been shut down.
    pub fn send(&self, message: Message) -> crate::error::Result<()> {
        self.sender.try_send(message).map_err(|e| {
            crate::error::Error::CommunicationLinkError(format!("send failed: {e}"))
        })
    }

    #[must_use]
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Trigger the stop token and join every worker thread.
    pub fn shutdown(mut self) {
        self.stop.trigger();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn delivers_messages_to_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let receiver = MessageReceiver::spawn(Quality::Qm, 2, 16, move |_msg| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        for _ in 0..5 {
            receiver
                .send(Message::NotifyOutdatedNodeId {
                    old_pid: 1,
                    target_pid: 2,
                })
                .unwrap();
        }

        std::thread::sleep(Duration::from_millis(200));
        receiver.shutdown();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn slow_qm_handler_does_not_block_asil_b_pool() {
        let asil_count = Arc::new(AtomicUsize::new(0));
        let asil_count_clone = Arc::clone(&asil_count);

        let qm = MessageReceiver::spawn(Quality::Qm, 1, 4, |_msg| {
            std::thread::sleep(Duration::from_secs(10));
        });
        let asil_b = MessageReceiver::spawn(Quality::AsilB, 1, 16, move |_msg| {
            asil_count_clone.fetch_add(1, Ordering::Relaxed);
        });

        qm.send(Message::NotifyOutdatedNodeId {
            old_pid: 1,
            target_pid: 2,
        })
        .unwrap();

        for _ in 0..20 {
            asil_b
                .send(Message::NotifyOutdatedNodeId {
                    old_pid: 1,
                    target_pid: 2,
                })
                .unwrap();
        }

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(asil_count.load(Ordering::Relaxed), 20);

        qm.stop_token().trigger();
        asil_b.shutdown();
        // qm's worker is sleeping 10s; don't join it in the test, just
        // trigger its stop token so the process can still exit.
        std::mem::forget(qm);
    }
}
