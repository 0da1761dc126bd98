// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Connector abstractions.
//!
//! This module defines the contracts between a channel and its connectors:
//! - [`SourceConnector`]: produces raw messages and hands them to the
//!   channel through a [`MessageDispatcher`] handle
//! - [`DestinationConnector`]: delivers an encoded payload downstream and
//!   reports a [`Response`]
//!
//! Connectors never hold a reference back to their channel. Everything they
//! need — the dispatcher handle, the event bus, the cancellation signal —
//! arrives in a context struct at start time, and channel → connector
//! ownership stays exclusive and directional.

use crate::error::Result;
use crate::event::EventBus;
use crate::message::{ConnectorMap, ConnectorMessage, Message, Response};
use crate::settings::DataType;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A raw payload handed from a source connector to the channel, plus any
/// intake metadata the connector wants visible in the source map.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub raw: String,
    pub source_map: ConnectorMap,
}

impl RawMessage {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into(), source_map: ConnectorMap::new() }
    }
}

/// What a dispatch produced, as far as the source connector is concerned.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// The message after the pipeline ran (partially, for asynchronous
    /// intake: `processed` stays false until the intake worker finishes).
    pub message: Message,
    /// The response selected for the source (first SENT destination's
    /// response when response storage is on).
    pub selected_response: Option<Response>,
}

/// Handle through which a source connector pushes messages into a channel.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, raw: RawMessage) -> Result<DispatchResult>;
}

/// Runtime context handed to a source connector at start.
#[derive(Clone)]
pub struct SourceContext {
    pub channel_id: String,
    pub channel_name: String,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub events: EventBus,
    /// Flipped by channel stop; the connector must observe it between units
    /// of work and during sleeps.
    pub cancellation: CancellationToken,
}

/// Runtime context handed to a destination connector at start.
#[derive(Clone)]
pub struct DestinationContext {
    pub channel_id: String,
    pub channel_name: String,
    pub metadata_id: u32,
    pub events: EventBus,
    pub cancellation: CancellationToken,
}

/// A message producer: one per channel.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Data type stamped on the RAW content of inbound messages.
    fn inbound_data_type(&self) -> DataType;

    /// Lifecycle hook run while the channel deploys, before anything starts.
    async fn on_deploy(&self) -> Result<()> {
        Ok(())
    }

    /// Lifecycle hook run while the channel undeploys.
    async fn on_undeploy(&self) -> Result<()> {
        Ok(())
    }

    /// Begins producing. Implementations spawn their own tasks and return;
    /// the tasks exit when `ctx.cancellation` fires.
    async fn start(&self, ctx: SourceContext) -> Result<()>;

    /// Stops producing and releases sockets. Must be idempotent.
    async fn stop(&self) -> Result<()>;
}

/// A message consumer: zero or more per channel.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn on_deploy(&self) -> Result<()> {
        Ok(())
    }

    async fn on_undeploy(&self) -> Result<()> {
        Ok(())
    }

    /// Prepares the connector (pools, timers). Called before the source
    /// starts; the context carries the cancellation signal for any
    /// background tasks the connector owns.
    async fn start(&self, ctx: DestinationContext) -> Result<()>;

    /// Stops the connector and closes pooled sockets. Must be idempotent.
    async fn stop(&self) -> Result<()>;

    /// Delivers the message's encoded content downstream.
    ///
    /// Transient transport failures are errors; the channel decides whether
    /// they queue or fail the destination. A returned [`Response`] with
    /// ERROR status means the payload was delivered but rejected.
    async fn send(&self, message: &ConnectorMessage) -> Result<Response>;
}
