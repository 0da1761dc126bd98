// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Dashboard status aggregation.
//!
//! A single task consumes the runtime event bus and folds events into a
//! per-channel view: lifecycle state, completed message count, and per-
//! connector connection status plus aggregate connection counts. The
//! aggregator never blocks emitters — a lagged subscription drops events
//! and keeps going.

use medbridge_core::{ConnectionStatus, EventBus, ServerEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live view of one connector.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ConnectorStatus {
    pub last_status: Option<ConnectionStatus>,
    pub last_info: Option<String>,
    /// Aggregate open-connection count, maintained from paired
    /// increment/decrement events.
    pub connection_count: i64,
}

/// Live view of one channel.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ChannelStatus {
    pub channel_name: String,
    pub state: Option<String>,
    pub messages_completed: u64,
    pub connectors: HashMap<u32, ConnectorStatus>,
}

type StatusMap = HashMap<String, ChannelStatus>;

/// Shared, concurrently readable dashboard state.
#[derive(Debug, Clone, Default)]
pub struct DashboardAggregator {
    inner: Arc<Mutex<StatusMap>>,
}

impl DashboardAggregator {
    /// Subscribes to the event bus and spawns the folding task.
    #[must_use]
    pub fn spawn(events: &EventBus, cancellation: CancellationToken) -> (Self, JoinHandle<()>) {
        let aggregator = Self::default();
        let mut rx = events.subscribe();
        let state = Arc::clone(&aggregator.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => Self::apply(&state, event),
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "dashboard aggregator lagged, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("dashboard aggregator stopped");
        });
        (aggregator, task)
    }

    fn apply(state: &Mutex<StatusMap>, event: ServerEvent) {
        let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match event {
            ServerEvent::StateChange { channel_id, channel_name, state: new_state, .. } => {
                let channel = state.entry(channel_id).or_default();
                channel.channel_name = channel_name;
                channel.state = Some(new_state);
            }
            ServerEvent::MessageComplete { channel_id, channel_name, .. } => {
                let channel = state.entry(channel_id).or_default();
                channel.channel_name = channel_name;
                channel.messages_completed += 1;
            }
            ServerEvent::ConnectionStatus { channel_id, metadata_id, status, info, .. } => {
                let connector =
                    state.entry(channel_id).or_default().connectors.entry(metadata_id).or_default();
                connector.last_status = Some(status);
                connector.last_info = info;
            }
            ServerEvent::ConnectorCount { channel_id, metadata_id, increment } => {
                let connector =
                    state.entry(channel_id).or_default().connectors.entry(metadata_id).or_default();
                connector.connection_count += if increment { 1 } else { -1 };
                if connector.connection_count < 0 {
                    connector.connection_count = 0;
                }
            }
        }
    }

    /// Snapshot of every channel's status.
    #[must_use]
    pub fn snapshot(&self) -> StatusMap {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Snapshot of one channel.
    #[must_use]
    pub fn channel(&self, channel_id: &str) -> Option<ChannelStatus> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(channel_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for<T>(probe: impl Fn() -> Option<T>) -> T {
        for _ in 0..100 {
            if let Some(value) = probe() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("aggregator did not observe the expected state in time");
    }

    #[tokio::test]
    async fn test_folds_lifecycle_and_completion_events() {
        let events = EventBus::default();
        let cancellation = CancellationToken::new();
        let (aggregator, task) = DashboardAggregator::spawn(&events, cancellation.clone());

        events.emit(ServerEvent::StateChange {
            channel_id: "ch-1".to_string(),
            channel_name: "ADT".to_string(),
            previous_state: "STOPPED".to_string(),
            state: "STARTED".to_string(),
        });
        events.emit(ServerEvent::MessageComplete {
            channel_id: "ch-1".to_string(),
            channel_name: "ADT".to_string(),
            message_id: 1,
        });
        events.emit(ServerEvent::MessageComplete {
            channel_id: "ch-1".to_string(),
            channel_name: "ADT".to_string(),
            message_id: 2,
        });

        let status = wait_for(|| {
            aggregator.channel("ch-1").filter(|status| status.messages_completed == 2)
        })
        .await;
        assert_eq!(status.state.as_deref(), Some("STARTED"));
        assert_eq!(status.channel_name, "ADT");

        cancellation.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_connection_counts_stay_consistent() {
        let events = EventBus::default();
        let cancellation = CancellationToken::new();
        let (aggregator, task) = DashboardAggregator::spawn(&events, cancellation.clone());

        events.emit_connector_count("ch-1", 0, true);
        events.emit_connector_count("ch-1", 0, true);
        events.emit_connector_count("ch-1", 0, false);
        events.emit_connection_status(
            "ch-1",
            0,
            "Source",
            ConnectionStatus::Connected,
            Some("peer".to_string()),
        );

        let status = wait_for(|| {
            aggregator.channel("ch-1").filter(|status| {
                status.connectors.get(&0).is_some_and(|c| c.last_status.is_some())
            })
        })
        .await;
        let connector = &status.connectors[&0];
        assert_eq!(connector.connection_count, 1);
        assert_eq!(connector.last_status, Some(ConnectionStatus::Connected));

        cancellation.cancel();
        let _ = task.await;
    }
}
