// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel-level configuration types.
//!
//! These are the deserialized form of the operator-facing channel
//! definition: identity, lifecycle scripts, storage mode, metadata columns,
//! and the per-connector queue policy. Connector-specific settings (TCP
//! host/port, framing, TLS) live with the connectors that consume them.

use crate::storage::StorageMode;
use serde::{Deserialize, Serialize};

/// Inbound/outbound payload data types recognized by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    Hl7v2,
    Raw,
    Json,
    Xml,
}

impl DataType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hl7v2 => "HL7V2",
            Self::Raw => "RAW",
            Self::Json => "JSON",
            Self::Xml => "XML",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State a channel should enter when it is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialState {
    #[default]
    Started,
    Paused,
    Stopped,
}

/// Type of a custom metadata column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaDataColumnType {
    String,
    Number,
    Boolean,
    Timestamp,
}

/// A channel-configured metadata column extracted from the connector maps
/// during transactional persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataColumn {
    pub name: String,
    pub column_type: MetaDataColumnType,
    /// Map key the value is read from (connector map, then channel map,
    /// then source map).
    pub mapping: String,
}

/// Retry-queue policy for a destination connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Send errors convert to QUEUED instead of ERROR.
    pub enabled: bool,
    /// Maximum send attempts before the entry is released as failed.
    /// Zero means retry forever.
    pub retry_count: u32,
    /// Sleep between attempts, and the poll interval on an empty queue.
    pub retry_interval_ms: u64,
    /// Validate the response after each queue send and retry on a response
    /// marked ERROR.
    pub validate_response: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { enabled: false, retry_count: 0, retry_interval_ms: 10_000, validate_response: false }
    }
}

/// Source intake policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceQueueSettings {
    /// When false the source responds only after the full pipeline ran
    /// (synchronous intake). When true, messages are acknowledged at T1 and
    /// processed by the intake worker.
    pub respond_after_processing: bool,
    /// In-memory ring capacity for asynchronous intake.
    pub buffer_capacity: usize,
}

impl Default for SourceQueueSettings {
    fn default() -> Self {
        Self { respond_after_processing: true, buffer_capacity: 1000 }
    }
}

/// Identity, scripts, and policy for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default)]
    pub message_storage_mode: StorageMode,
    #[serde(default)]
    pub encrypt_data: bool,
    #[serde(default)]
    pub metadata_columns: Vec<MetaDataColumn>,
    #[serde(default)]
    pub preprocessor_script: Option<String>,
    #[serde(default)]
    pub postprocessor_script: Option<String>,
    #[serde(default)]
    pub deploy_script: Option<String>,
    #[serde(default)]
    pub undeploy_script: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl ChannelSettings {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            initial_state: InitialState::default(),
            message_storage_mode: StorageMode::default(),
            encrypt_data: false,
            metadata_columns: Vec::new(),
            preprocessor_script: None,
            postprocessor_script: None,
            deploy_script: None,
            undeploy_script: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_settings_defaults() {
        let q = QueueSettings::default();
        assert!(!q.enabled);
        assert_eq!(q.retry_count, 0);
        assert_eq!(q.retry_interval_ms, 10_000);
    }

    #[test]
    fn test_channel_settings_deserialize_minimal() {
        let json = r#"{"id": "c1", "name": "ADT Inbound"}"#;
        let settings: ChannelSettings = serde_json::from_str(json).expect("valid settings");
        assert!(settings.enabled);
        assert_eq!(settings.message_storage_mode, StorageMode::Production);
        assert_eq!(settings.initial_state, InitialState::Started);
    }
}
