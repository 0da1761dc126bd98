// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Message statistics tracking.
//!
//! Counters are structured channel → metadata id (None = channel aggregate)
//! → status. [`Statistics::update_status`] is the atomic unit; the channel
//! pipeline batches updates as [`StatsOp`]s and applies them after the
//! enclosing store transaction commits.
//!
//! Aggregate rules: RECEIVED only accumulates from the source (metadata id
//! 0); SENT only from destinations (metadata id > 0); FILTERED and ERROR
//! accumulate from any connector.

use crate::message::Status;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Counter block for one connector (or the channel aggregate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub received: i64,
    pub filtered: i64,
    pub sent: i64,
    pub error: i64,
    pub queued: i64,
    pub pending: i64,
}

impl StatusCounts {
    #[must_use]
    pub const fn get(&self, status: Status) -> i64 {
        match status {
            Status::Received => self.received,
            Status::Filtered => self.filtered,
            Status::Sent => self.sent,
            Status::Error => self.error,
            Status::Queued => self.queued,
            Status::Pending => self.pending,
            Status::Transformed => 0,
        }
    }

    fn slot_mut(&mut self, status: Status) -> Option<&mut i64> {
        match status {
            Status::Received => Some(&mut self.received),
            Status::Filtered => Some(&mut self.filtered),
            Status::Sent => Some(&mut self.sent),
            Status::Error => Some(&mut self.error),
            Status::Queued => Some(&mut self.queued),
            Status::Pending => Some(&mut self.pending),
            // TRANSFORMED is a pipeline state, not a tracked statistic.
            Status::Transformed => None,
        }
    }
}

/// One deferred statistics update, accumulated during a pipeline phase and
/// flushed with that phase's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsOp {
    pub metadata_id: u32,
    pub increment: Status,
    pub decrement: Option<Status>,
}

/// Per-channel counters keyed by connector; `None` is the channel aggregate.
pub type ChannelCounts = HashMap<Option<u32>, StatusCounts>;

/// Process-wide statistics accumulator, shared by every channel.
///
/// Counters never go negative: decrements below zero clamp at zero unless
/// `allow_negatives` was set at construction.
#[derive(Debug)]
pub struct Statistics {
    inner: Mutex<HashMap<String, ChannelCounts>>,
    allow_negatives: bool,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Statistics {
    #[must_use]
    pub fn new(allow_negatives: bool) -> Self {
        Self { inner: Mutex::new(HashMap::new()), allow_negatives }
    }

    /// Applies one increment (and optional decrement) for a connector,
    /// updating the channel aggregate per the accumulation rules.
    pub fn update_status(
        &self,
        channel_id: &str,
        metadata_id: u32,
        increment: Status,
        decrement: Option<Status>,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let channel = inner.entry(channel_id.to_string()).or_default();

        Self::apply(channel.entry(Some(metadata_id)).or_default(), increment, decrement, 1, self.allow_negatives);

        if Self::counts_toward_aggregate(metadata_id, increment) {
            let decrement_for_aggregate =
                decrement.filter(|d| Self::counts_toward_aggregate(metadata_id, *d));
            Self::apply(
                channel.entry(None).or_default(),
                increment,
                decrement_for_aggregate,
                1,
                self.allow_negatives,
            );
        } else if let Some(d) = decrement.filter(|d| Self::counts_toward_aggregate(metadata_id, *d)) {
            Self::apply_decrement(channel.entry(None).or_default(), d, self.allow_negatives);
        }
    }

    /// Applies a batch of deferred ops for one channel.
    pub fn apply_ops(&self, channel_id: &str, ops: &[StatsOp]) {
        for op in ops {
            self.update_status(channel_id, op.metadata_id, op.increment, op.decrement);
        }
    }

    /// Replaces the counters for one channel, used when loading accumulated
    /// statistics from the store at channel start.
    pub fn load_channel(&self, channel_id: &str, counts: ChannelCounts) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.insert(channel_id.to_string(), counts);
    }

    /// Drops the counters for one channel (undeploy).
    pub fn remove_channel(&self, channel_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.remove(channel_id);
    }

    /// Snapshot of one connector's counters. `None` metadata id reads the
    /// channel aggregate.
    #[must_use]
    pub fn connector_counts(&self, channel_id: &str, metadata_id: Option<u32>) -> StatusCounts {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .get(channel_id)
            .and_then(|channel| channel.get(&metadata_id))
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of a whole channel's counters.
    #[must_use]
    pub fn channel_counts(&self, channel_id: &str) -> ChannelCounts {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.get(channel_id).cloned().unwrap_or_default()
    }

    /// Whether a status update on `metadata_id` contributes to the channel
    /// aggregate row.
    pub const fn counts_toward_aggregate(metadata_id: u32, status: Status) -> bool {
        match status {
            Status::Received => metadata_id == 0,
            Status::Sent => metadata_id > 0,
            Status::Filtered | Status::Error | Status::Queued | Status::Pending => true,
            Status::Transformed => false,
        }
    }

    fn apply(
        counts: &mut StatusCounts,
        increment: Status,
        decrement: Option<Status>,
        delta: i64,
        allow_negatives: bool,
    ) {
        if let Some(slot) = counts.slot_mut(increment) {
            *slot += delta;
        }
        if let Some(d) = decrement {
            Self::apply_decrement(counts, d, allow_negatives);
        }
    }

    fn apply_decrement(counts: &mut StatusCounts, status: Status, allow_negatives: bool) {
        if let Some(slot) = counts.slot_mut(status) {
            *slot -= 1;
            if *slot < 0 && !allow_negatives {
                *slot = 0;
            }
        }
    }
}

/// Expands a batch of deferred ops into signed per-row deltas (connector
/// rows plus the `None` aggregate row), applying the same accumulation rules
/// as [`Statistics::update_status`]. Used by the store to persist a phase's
/// statistics inside its transaction; clamping happens at the write site.
#[must_use]
pub fn expand_ops(ops: &[StatsOp]) -> HashMap<Option<u32>, StatusCounts> {
    fn bump(counts: &mut StatusCounts, status: Status, delta: i64) {
        match status {
            Status::Received => counts.received += delta,
            Status::Filtered => counts.filtered += delta,
            Status::Sent => counts.sent += delta,
            Status::Error => counts.error += delta,
            Status::Queued => counts.queued += delta,
            Status::Pending => counts.pending += delta,
            Status::Transformed => {}
        }
    }

    let mut deltas: HashMap<Option<u32>, StatusCounts> = HashMap::new();
    for op in ops {
        let connector = deltas.entry(Some(op.metadata_id)).or_default();
        bump(connector, op.increment, 1);
        if let Some(d) = op.decrement {
            bump(connector, d, -1);
        }

        let aggregate = deltas.entry(None).or_default();
        if Statistics::counts_toward_aggregate(op.metadata_id, op.increment) {
            bump(aggregate, op.increment, 1);
        }
        if let Some(d) =
            op.decrement.filter(|d| Statistics::counts_toward_aggregate(op.metadata_id, *d))
        {
            bump(aggregate, d, -1);
        }
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_ops_mirrors_aggregate_rules() {
        let ops = [
            StatsOp { metadata_id: 0, increment: Status::Received, decrement: None },
            StatsOp { metadata_id: 1, increment: Status::Sent, decrement: Some(Status::Queued) },
            StatsOp { metadata_id: 2, increment: Status::Error, decrement: None },
        ];
        let deltas = expand_ops(&ops);

        assert_eq!(deltas[&Some(0)].received, 1);
        assert_eq!(deltas[&Some(1)].sent, 1);
        assert_eq!(deltas[&Some(1)].queued, -1);
        assert_eq!(deltas[&Some(2)].error, 1);

        let aggregate = &deltas[&None];
        assert_eq!(aggregate.received, 1);
        assert_eq!(aggregate.sent, 1);
        assert_eq!(aggregate.error, 1);
        assert_eq!(aggregate.queued, -1);
    }

    #[test]
    fn test_received_only_aggregates_from_source() {
        let stats = Statistics::default();
        stats.update_status("c1", 0, Status::Received, None);
        stats.update_status("c1", 1, Status::Received, None);

        assert_eq!(stats.connector_counts("c1", Some(0)).received, 1);
        assert_eq!(stats.connector_counts("c1", Some(1)).received, 1);
        assert_eq!(stats.connector_counts("c1", None).received, 1);
    }

    #[test]
    fn test_sent_only_aggregates_from_destinations() {
        let stats = Statistics::default();
        stats.update_status("c1", 0, Status::Sent, None);
        stats.update_status("c1", 1, Status::Sent, None);
        stats.update_status("c1", 2, Status::Sent, None);

        assert_eq!(stats.connector_counts("c1", None).sent, 2);
    }

    #[test]
    fn test_filtered_and_error_aggregate_from_any_connector() {
        let stats = Statistics::default();
        stats.update_status("c1", 0, Status::Filtered, None);
        stats.update_status("c1", 2, Status::Error, None);

        let aggregate = stats.connector_counts("c1", None);
        assert_eq!(aggregate.filtered, 1);
        assert_eq!(aggregate.error, 1);
    }

    #[test]
    fn test_decrement_clamps_at_zero() {
        let stats = Statistics::default();
        stats.update_status("c1", 1, Status::Sent, Some(Status::Queued));
        assert_eq!(stats.connector_counts("c1", Some(1)).queued, 0);
    }

    #[test]
    fn test_allow_negatives_flag() {
        let stats = Statistics::new(true);
        stats.update_status("c1", 1, Status::Sent, Some(Status::Queued));
        assert_eq!(stats.connector_counts("c1", Some(1)).queued, -1);
    }

    #[test]
    fn test_queue_retry_trajectory_keeps_error_untouched() {
        // A queue-enabled destination that eventually sends: QUEUED goes up
        // on the first failure, then SENT increments and QUEUED drains.
        let stats = Statistics::default();
        stats.update_status("c1", 1, Status::Queued, None);
        stats.update_status("c1", 1, Status::Sent, Some(Status::Queued));

        let counts = stats.connector_counts("c1", Some(1));
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.queued, 0);
        assert_eq!(counts.error, 0);
    }
}
