// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel runtime for the Medbridge integration engine.
//!
//! The [`Channel`] is the unit of deployment: one source connector, a
//! fan-out of destinations (each with optional retry queue), operator
//! scripts at every seam, and transactional persistence sufficient to
//! recover from a crash at any pipeline step.
//!
//! Modules:
//! - [`channel`]: lifecycle, state machine, builder
//! - [`destination`]: destination base and the retry queue worker
//! - [`queue`]: the FIFO retry queue
//! - [`store`]: SQLite-backed per-channel persistence (tables, T1-T4)
//! - [`ids`]: durable / cluster-safe message-id allocation
//! - `pipeline` (internal): the dispatch path itself
//! - [`script_js`] (feature `script`): embedded QuickJS executor

pub mod channel;
pub mod destination;
pub mod ids;
mod pipeline;
pub mod queue;
mod recovery;
#[cfg(feature = "script")]
pub mod script_js;
pub mod store;

pub use channel::{Channel, ChannelBuilder, ChannelState};
pub use destination::Destination;
pub use ids::MessageIdAllocator;
pub use queue::{DestinationQueue, Release};
#[cfg(feature = "script")]
pub use script_js::JsScriptExecutor;
pub use store::MessageStore;

#[cfg(test)]
mod tests;
