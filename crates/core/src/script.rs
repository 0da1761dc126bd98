// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Script-executor interface.
//!
//! The runtime treats operator-authored filter/transformer code as an opaque
//! function from `(script, bindings)` to a result. Implementations may embed
//! a sandboxed evaluator (the engine ships a QuickJS one behind the `script`
//! feature), shell out to a subprocess, or stub the executor in tests.
//!
//! Binding conventions, shared by every executor implementation:
//! - `msg` is the payload string the script operates on. Transformers mutate
//!   it (or leave it untouched); the post-execution value of `msg` is the
//!   transformed content.
//! - `sourceMap` is read-only by convention; `channelMap`, `connectorMap`
//!   and `responseMap` are read back after execution.
//! - `destinationSet` (when present) is a mutable array of metadata ids;
//!   scripts remove entries to skip destinations.
//! - The script's completion value is returned as `value`; filters return a
//!   boolean (truthy = accept).

use crate::message::ConnectorMap;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Default wall-clock budget for one script execution.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;

/// Errors surfaced by a script executor.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script syntax error: {0}")]
    Syntax(String),
    #[error("script execution error: {0}")]
    Execution(String),
    #[error("script timed out after {0} ms")]
    Timeout(u64),
}

/// The mutable map bundle handed to a script and read back afterwards.
#[derive(Debug, Clone, Default)]
pub struct ScriptMaps {
    pub source_map: ConnectorMap,
    pub channel_map: ConnectorMap,
    pub connector_map: ConnectorMap,
    pub response_map: ConnectorMap,
}

/// Everything a script execution sees.
#[derive(Debug, Clone)]
pub struct ScriptBindings {
    pub channel_id: String,
    pub channel_name: String,
    pub connector_name: String,
    pub message_id: i64,
    pub metadata_id: u32,
    /// Payload the script operates on (`msg`).
    pub message: String,
    pub maps: ScriptMaps,
    /// Seeded for source filter/transformer executions only.
    pub destination_set: Option<Vec<u32>>,
}

impl ScriptBindings {
    /// Minimal bindings for channel-lifecycle scripts (deploy/undeploy),
    /// which have no message in scope.
    #[must_use]
    pub fn lifecycle(channel_id: &str, channel_name: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            channel_name: channel_name.to_string(),
            connector_name: String::new(),
            message_id: 0,
            metadata_id: 0,
            message: String::new(),
            maps: ScriptMaps::default(),
            destination_set: None,
        }
    }
}

/// What came back from a script execution.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// The script's completion value.
    pub value: JsonValue,
    /// Post-execution `msg`.
    pub message: String,
    /// Post-execution maps (sourceMap excluded; it is read-only).
    pub maps: ScriptMaps,
    /// Post-execution destination set, when one was seeded.
    pub destination_set: Option<Vec<u32>>,
}

impl ScriptOutcome {
    /// Filter convention: the completion value decides acceptance.
    /// Anything other than an explicit `false`/`null` accepts.
    #[must_use]
    pub fn accepted(&self) -> bool {
        !matches!(self.value, JsonValue::Bool(false) | JsonValue::Null)
    }
}

/// Opaque evaluator for operator-authored scripts.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(
        &self,
        script: &str,
        bindings: ScriptBindings,
    ) -> Result<ScriptOutcome, ScriptError>;
}

/// Executor that runs no code: every script accepts and leaves the message
/// and maps untouched. Useful for channels without scripts and as a test
/// default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScriptExecutor;

#[async_trait]
impl ScriptExecutor for NoopScriptExecutor {
    async fn execute(
        &self,
        _script: &str,
        bindings: ScriptBindings,
    ) -> Result<ScriptOutcome, ScriptError> {
        Ok(ScriptOutcome {
            value: JsonValue::Bool(true),
            message: bindings.message,
            maps: bindings.maps,
            destination_set: bindings.destination_set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_acceptance_convention() {
        let outcome = |value: JsonValue| ScriptOutcome {
            value,
            message: String::new(),
            maps: ScriptMaps::default(),
            destination_set: None,
        };

        assert!(outcome(JsonValue::Bool(true)).accepted());
        assert!(outcome(JsonValue::String("yes".to_string())).accepted());
        assert!(!outcome(JsonValue::Bool(false)).accepted());
        assert!(!outcome(JsonValue::Null).accepted());
    }

    #[tokio::test]
    async fn test_noop_executor_passes_through() {
        let mut bindings = ScriptBindings::lifecycle("c1", "ADT");
        bindings.message = "MSH|...".to_string();
        let outcome = NoopScriptExecutor.execute("return false;", bindings).await.expect("noop");
        assert!(outcome.accepted());
        assert_eq!(outcome.message, "MSH|...");
    }
}
