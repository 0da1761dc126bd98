// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Runtime event model.
//!
//! Channels and connectors publish lifecycle and progress events onto a
//! process-wide [`EventBus`]; the dashboard aggregator (and anything else
//! that cares) subscribes. Emission is best-effort and never blocks the
//! pipeline: slow subscribers lose events rather than applying backpressure.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Connection-level state reported by connectors at every meaningful
/// boundary so the dashboard can render live connector activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Sending,
    WaitingForResponse,
    Failure,
    Info,
}

/// Events published by the channel runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A channel completed a lifecycle transition.
    StateChange {
        channel_id: String,
        channel_name: String,
        previous_state: String,
        state: String,
    },
    /// A message finished the pipeline (processed = true).
    MessageComplete {
        channel_id: String,
        channel_name: String,
        message_id: i64,
    },
    /// A connector crossed a connection boundary.
    ConnectionStatus {
        channel_id: String,
        metadata_id: u32,
        connector_name: String,
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<String>,
    },
    /// Paired increment/decrement so aggregate connection counts stay
    /// consistent across connect/disconnect.
    ConnectorCount {
        channel_id: String,
        metadata_id: u32,
        increment: bool,
    },
}

/// Cloneable handle for publishing and subscribing to runtime events.
///
/// Backed by a broadcast channel: every subscriber sees every event emitted
/// after it subscribed, up to the configured lag capacity.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. A send error only means there are no subscribers
    /// right now, which is fine.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    /// Convenience for connection-status events.
    pub fn emit_connection_status(
        &self,
        channel_id: &str,
        metadata_id: u32,
        connector_name: &str,
        status: ConnectionStatus,
        info: Option<String>,
    ) {
        self.emit(ServerEvent::ConnectionStatus {
            channel_id: channel_id.to_string(),
            metadata_id,
            connector_name: connector_name.to_string(),
            status,
            info,
        });
    }

    /// Convenience for paired connector-count events.
    pub fn emit_connector_count(&self, channel_id: &str, metadata_id: u32, increment: bool) {
        self.emit(ServerEvent::ConnectorCount {
            channel_id: channel_id.to_string(),
            metadata_id,
            increment,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
