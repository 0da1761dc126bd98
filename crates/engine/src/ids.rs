// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Message-id allocation.
//!
//! Ids are monotonic within a channel. With channel tables present, every
//! id is drawn from the channel's durable sequence; cluster mode amortizes
//! the sequence round-trip by drawing blocks, which keeps ids unique across
//! nodes sharing the store. Without tables the allocator degrades to a
//! process-local counter.

use crate::store::MessageStore;
use medbridge_core::Result;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

/// Ids drawn per sequence round-trip in cluster mode.
const CLUSTER_BLOCK_SIZE: i64 = 100;

enum Mode {
    /// In-memory counter; used when the channel has no tables.
    Local(AtomicI64),
    /// Durable sequence, drawn one id (standalone) or one block (cluster)
    /// at a time.
    Durable { store: MessageStore, local_id: i64, block: Mutex<(i64, i64)>, block_size: i64 },
}

/// Per-channel message-id source.
pub struct MessageIdAllocator {
    mode: Mode,
}

impl MessageIdAllocator {
    /// Allocator for a channel without durable tables.
    #[must_use]
    pub fn local() -> Self {
        Self { mode: Mode::Local(AtomicI64::new(0)) }
    }

    /// Durable allocator. `cluster` selects block allocation.
    #[must_use]
    pub fn durable(store: MessageStore, local_id: i64, cluster: bool) -> Self {
        let block_size = if cluster { CLUSTER_BLOCK_SIZE } else { 1 };
        Self {
            mode: Mode::Durable {
                store,
                local_id,
                // (next, last): empty block forces a draw on first use.
                block: Mutex::new((1, 0)),
                block_size,
            },
        }
    }

    /// Returns the next message id.
    pub async fn next(&self) -> Result<i64> {
        match &self.mode {
            Mode::Local(counter) => Ok(counter.fetch_add(1, Ordering::SeqCst) + 1),
            Mode::Durable { store, local_id, block, block_size } => {
                let mut block = block.lock().await;
                if block.0 > block.1 {
                    *block = store.next_sequence_block(*local_id, *block_size).await?;
                }
                let id = block.0;
                block.0 += 1;
                Ok(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_allocator_is_monotonic() {
        let allocator = MessageIdAllocator::local();
        let a = allocator.next().await.expect("id");
        let b = allocator.next().await.expect("id");
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_durable_allocator_survives_reload() {
        let store = MessageStore::in_memory().await.expect("store");
        let local_id = store.register_channel("ch").await.expect("register");

        let allocator = MessageIdAllocator::durable(store.clone(), local_id, false);
        assert_eq!(allocator.next().await.expect("id"), 1);
        assert_eq!(allocator.next().await.expect("id"), 2);

        // A fresh allocator (restart) continues after the last drawn id.
        let allocator = MessageIdAllocator::durable(store, local_id, false);
        assert_eq!(allocator.next().await.expect("id"), 3);
    }

    #[tokio::test]
    async fn test_cluster_blocks_do_not_collide() {
        let store = MessageStore::in_memory().await.expect("store");
        let local_id = store.register_channel("ch").await.expect("register");

        let node_a = MessageIdAllocator::durable(store.clone(), local_id, true);
        let node_b = MessageIdAllocator::durable(store, local_id, true);

        let a = node_a.next().await.expect("id");
        let b = node_b.next().await.expect("id");
        assert_ne!(a, b);
        assert_eq!(a, 1);
        assert_eq!(b, 101);
    }
}
