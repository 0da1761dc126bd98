// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Destination retry queue.
//!
//! The in-memory buffer fronts the durable QUEUED rows in the channel's
//! connector-message store: entries are enqueued when a send fails (or the
//! destination always queues), acquired by the queue worker in FIFO order,
//! and re-inserted at the tail on retry. At channel start the buffer is
//! rehydrated from the store.

use medbridge_core::ConnectorMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// What the worker does with an acquired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Back to the tail for another attempt.
    Retry,
    /// Terminal (sent or exhausted); the entry leaves the queue for good.
    Completed,
}

/// FIFO retry queue for one destination.
#[derive(Debug, Default)]
pub struct DestinationQueue {
    buffer: Mutex<VecDeque<ConnectorMessage>>,
    notify: Notify,
}

impl DestinationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: ConnectorMessage) {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(message);
        self.notify.notify_one();
    }

    /// Pops the oldest entry, or `None` when the queue is empty.
    #[must_use]
    pub fn acquire(&self) -> Option<ConnectorMessage> {
        self.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front()
    }

    /// Returns an acquired entry to the queue, or drops it when terminal.
    pub fn release(&self, message: ConnectorMessage, disposition: Release) {
        match disposition {
            Release::Retry => self.enqueue(message),
            Release::Completed => {}
        }
    }

    /// Seeds the buffer from durable QUEUED rows at channel start.
    pub fn rehydrate(&self, messages: Vec<ConnectorMessage>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for message in messages {
            buffer.push_back(message);
        }
        if !buffer.is_empty() {
            self.notify.notify_one();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when something lands in the queue. Lets the worker's
    /// empty-queue sleep wake early.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn entry(message_id: i64) -> ConnectorMessage {
        ConnectorMessage::new(
            message_id,
            1,
            "ch".to_string(),
            "Channel".to_string(),
            "Dst1".to_string(),
            "server".to_string(),
            SystemTime::now(),
        )
    }

    #[test]
    fn test_fifo_order_and_retry_to_tail() {
        let queue = DestinationQueue::new();
        queue.enqueue(entry(1));
        queue.enqueue(entry(2));

        let first = queue.acquire().expect("first");
        assert_eq!(first.message_id, 1);
        queue.release(first, Release::Retry);

        // The retried entry went to the tail.
        assert_eq!(queue.acquire().expect("second").message_id, 2);
        assert_eq!(queue.acquire().expect("retried").message_id, 1);
        assert!(queue.acquire().is_none());
    }

    #[test]
    fn test_completed_release_drops_entry() {
        let queue = DestinationQueue::new();
        queue.enqueue(entry(1));
        let acquired = queue.acquire().expect("entry");
        queue.release(acquired, Release::Completed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rehydrate_preserves_order() {
        let queue = DestinationQueue::new();
        queue.rehydrate(vec![entry(5), entry(6)]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.acquire().expect("first").message_id, 5);
    }
}
