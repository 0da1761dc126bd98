// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core message model and runtime interfaces for the Medbridge integration
//! engine.
//!
//! This crate defines everything the channel runtime and its connectors
//! agree on without depending on each other:
//! - [`message`]: the [`Message`]/[`ConnectorMessage`] model, statuses,
//!   typed content slots, and the destination-set conventions
//! - [`connector`]: the source/destination connector contracts and the
//!   dispatcher handle connectors push messages through
//! - [`storage`]: storage modes and the persistence flags they expand to
//! - [`settings`]: channel-level configuration types
//! - [`event`]: the runtime event model and the process-wide [`EventBus`]
//! - [`stats`]: the statistics accumulator and its aggregation rules
//! - [`script`]: the opaque script-executor interface
//! - [`attachment`]: the attachment-extraction interface

pub mod attachment;
pub mod connector;
pub mod error;
pub mod event;
pub mod message;
pub mod script;
pub mod settings;
pub mod stats;
pub mod storage;

pub use attachment::{Attachment, AttachmentExtraction, AttachmentHandler, PassthroughAttachmentHandler};
pub use connector::{
    DestinationConnector, DestinationContext, DispatchResult, MessageDispatcher, RawMessage,
    SourceConnector, SourceContext,
};
pub use error::{EngineError, Result};
pub use event::{ConnectionStatus, EventBus, ServerEvent};
pub use message::{
    ConnectorMap, ConnectorMessage, ContentType, Message, MessageContent, Response, Status,
};
pub use script::{
    NoopScriptExecutor, ScriptBindings, ScriptError, ScriptExecutor, ScriptMaps, ScriptOutcome,
};
pub use settings::{
    ChannelSettings, DataType, InitialState, MetaDataColumn, MetaDataColumnType, QueueSettings,
    SourceQueueSettings,
};
pub use stats::{expand_ops, ChannelCounts, Statistics, StatsOp, StatusCounts};
pub use storage::{StorageMode, StorageSettings};
