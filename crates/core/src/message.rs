// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core message model.
//!
//! A [`Message`] is the umbrella for one received payload. It owns one
//! [`ConnectorMessage`] per connector that has touched it: the source at
//! metadata id 0, and each destination at its own metadata id (1+). Every
//! state transition in the pipeline mutates a `ConnectorMessage` and, where
//! storage is enabled, persists a typed content row keyed by
//! `(message_id, metadata_id, content_type)`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reserved source-map key holding the set of destination metadata ids still
/// eligible for dispatch. Operator scripts remove entries to skip
/// destinations.
pub const DESTINATION_SET_KEY: &str = "destinationSet";

/// Reserved source-map key holding the destination name → metadata id map
/// used for name-based removal. Names are not guaranteed unique; removal by
/// name removes every match.
pub const DESTINATION_NAME_MAP_KEY: &str = "destinationNameMap";

/// Reserved source-map key under which the raw payload is stashed while a
/// message sits on the source intake queue.
pub const QUEUED_RAW_KEY: &str = "queuedRaw";

/// Per-connector processing status.
///
/// Persisted as a single character code (`R`, `F`, `T`, `S`, `Q`, `E`, `P`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Received,
    Filtered,
    Transformed,
    Sent,
    Queued,
    Error,
    /// Checkpoint written after a successful send, before the response
    /// transformer runs. Recovery replays the response transformer for
    /// PENDING rows but never the network send.
    Pending,
}

impl Status {
    /// The single-character code used in the connector-message table.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Received => 'R',
            Self::Filtered => 'F',
            Self::Transformed => 'T',
            Self::Sent => 'S',
            Self::Queued => 'Q',
            Self::Error => 'E',
            Self::Pending => 'P',
        }
    }

    /// Parses a persisted status code.
    #[must_use]
    pub const fn from_char(code: char) -> Option<Self> {
        match code {
            'R' => Some(Self::Received),
            'F' => Some(Self::Filtered),
            'T' => Some(Self::Transformed),
            'S' => Some(Self::Sent),
            'Q' => Some(Self::Queued),
            'E' => Some(Self::Error),
            'P' => Some(Self::Pending),
            _ => None,
        }
    }

    /// Whether this status is terminal for a destination connector.
    /// QUEUED and PENDING are in-flight; everything else is settled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Filtered | Self::Error | Self::Transformed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Filtered => "FILTERED",
            Self::Transformed => "TRANSFORMED",
            Self::Sent => "SENT",
            Self::Queued => "QUEUED",
            Self::Error => "ERROR",
            Self::Pending => "PENDING",
        };
        f.write_str(name)
    }
}

/// Typed content slots carried by a connector message.
///
/// Map and error slots share the content table with the payload slots; the
/// integer codes are part of the persisted schema and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Raw,
    ProcessedRaw,
    Transformed,
    Encoded,
    Sent,
    Response,
    ResponseTransformed,
    ProcessedResponse,
    ConnectorMap,
    ChannelMap,
    ResponseMap,
    SourceMap,
    ProcessingError,
    PostprocessorError,
    ResponseError,
}

impl ContentType {
    /// Stable integer code used in the content table.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Raw => 1,
            Self::ProcessedRaw => 2,
            Self::Transformed => 3,
            Self::Encoded => 4,
            Self::Sent => 5,
            Self::Response => 6,
            Self::ResponseTransformed => 7,
            Self::ProcessedResponse => 8,
            Self::ConnectorMap => 9,
            Self::ChannelMap => 10,
            Self::ResponseMap => 11,
            Self::SourceMap => 12,
            Self::ProcessingError => 13,
            Self::PostprocessorError => 14,
            Self::ResponseError => 15,
        }
    }

    /// Parses a persisted content-type code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Raw),
            2 => Some(Self::ProcessedRaw),
            3 => Some(Self::Transformed),
            4 => Some(Self::Encoded),
            5 => Some(Self::Sent),
            6 => Some(Self::Response),
            7 => Some(Self::ResponseTransformed),
            8 => Some(Self::ProcessedResponse),
            9 => Some(Self::ConnectorMap),
            10 => Some(Self::ChannelMap),
            11 => Some(Self::ResponseMap),
            12 => Some(Self::SourceMap),
            13 => Some(Self::ProcessingError),
            14 => Some(Self::PostprocessorError),
            15 => Some(Self::ResponseError),
            _ => None,
        }
    }
}

/// One typed content slot: the payload plus the data type it was produced as
/// and whether the stored copy is encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub content_type: ContentType,
    pub content: String,
    pub data_type: Option<String>,
    pub encrypted: bool,
}

impl MessageContent {
    #[must_use]
    pub fn new(content_type: ContentType, content: String, data_type: Option<String>) -> Self {
        Self { content_type, content, data_type, encrypted: false }
    }
}

/// The response a destination connector produced for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    /// Raw response payload (e.g. the unframed ACK bytes as text).
    pub message: String,
    /// Short human-readable qualifier ("Message successfully sent", ...).
    pub status_message: Option<String>,
    /// Error detail when `status` is ERROR or QUEUED.
    pub error: Option<String>,
}

impl Response {
    #[must_use]
    pub fn sent(message: String) -> Self {
        Self { status: Status::Sent, message, status_message: None, error: None }
    }

    #[must_use]
    pub fn error(message: String, error: String) -> Self {
        Self { status: Status::Error, message, status_message: None, error: Some(error) }
    }

    #[must_use]
    pub fn queued(message: String, error: String) -> Self {
        Self { status: Status::Queued, message, status_message: None, error: Some(error) }
    }
}

/// String-keyed scratch map carried by connector messages.
pub type ConnectorMap = IndexMap<String, JsonValue>;

/// The per-connector-per-message unit carrying content, status, maps, and
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorMessage {
    pub message_id: i64,
    /// 0 = source connector, 1+ = destinations in declaration order.
    pub metadata_id: u32,
    pub channel_id: String,
    pub channel_name: String,
    pub connector_name: String,
    pub server_id: String,
    pub received_date: SystemTime,
    pub status: Status,
    pub send_attempts: u32,
    pub send_date: Option<SystemTime>,
    pub response_date: Option<SystemTime>,
    pub error_code: i32,
    pub processing_error: Option<String>,
    pub response_error: Option<String>,
    pub postprocessor_error: Option<String>,
    /// Read-only once the filter starts; holds intake metadata plus the
    /// reserved destination-set keys.
    pub source_map: ConnectorMap,
    /// Shared across destinations within one message.
    pub channel_map: ConnectorMap,
    /// Per-connector scratch.
    pub connector_map: ConnectorMap,
    pub response_map: ConnectorMap,
    content: BTreeMap<ContentType, MessageContent>,
}

impl ConnectorMessage {
    #[must_use]
    pub fn new(
        message_id: i64,
        metadata_id: u32,
        channel_id: String,
        channel_name: String,
        connector_name: String,
        server_id: String,
        received_date: SystemTime,
    ) -> Self {
        Self {
            message_id,
            metadata_id,
            channel_id,
            channel_name,
            connector_name,
            server_id,
            received_date,
            status: Status::Received,
            send_attempts: 0,
            send_date: None,
            response_date: None,
            error_code: 0,
            processing_error: None,
            response_error: None,
            postprocessor_error: None,
            source_map: ConnectorMap::new(),
            channel_map: ConnectorMap::new(),
            connector_map: ConnectorMap::new(),
            response_map: ConnectorMap::new(),
            content: BTreeMap::new(),
        }
    }

    pub fn set_content(&mut self, content: MessageContent) {
        self.content.insert(content.content_type, content);
    }

    #[must_use]
    pub fn content(&self, content_type: ContentType) -> Option<&MessageContent> {
        self.content.get(&content_type)
    }

    /// Convenience accessor returning the content string for a slot.
    #[must_use]
    pub fn content_str(&self, content_type: ContentType) -> Option<&str> {
        self.content.get(&content_type).map(|c| c.content.as_str())
    }

    /// All populated content slots in code order.
    pub fn contents(&self) -> impl Iterator<Item = &MessageContent> {
        self.content.values()
    }

    /// The input a destination raw slot is computed from: the source's
    /// ENCODED content, else TRANSFORMED, else RAW.
    #[must_use]
    pub fn encoded_or_raw(&self) -> Option<&str> {
        self.content_str(ContentType::Encoded)
            .or_else(|| self.content_str(ContentType::Transformed))
            .or_else(|| self.content_str(ContentType::Raw))
    }

    /// The content a preprocessor/filter chain reads: PROCESSED_RAW when the
    /// preprocessor produced one, else RAW.
    #[must_use]
    pub fn processed_raw_or_raw(&self) -> Option<&str> {
        self.content_str(ContentType::ProcessedRaw).or_else(|| self.content_str(ContentType::Raw))
    }

    /// Clones this (source) connector message for a destination. The source
    /// map travels with the clone; channel map is seeded by the caller with
    /// the message-wide working copy; connector and response maps start
    /// fresh.
    #[must_use]
    pub fn clone_for_destination(&self, metadata_id: u32, connector_name: String) -> Self {
        let mut cloned = Self::new(
            self.message_id,
            metadata_id,
            self.channel_id.clone(),
            self.channel_name.clone(),
            connector_name,
            self.server_id.clone(),
            SystemTime::now(),
        );
        cloned.source_map = self.source_map.clone();
        cloned
    }
}

/// Umbrella for one received message across all connectors of a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub channel_id: String,
    pub server_id: String,
    pub received_date: SystemTime,
    pub processed: bool,
    /// Keyed by metadata id; iteration order is metadata-id order, which is
    /// also declaration order for destinations.
    pub connector_messages: BTreeMap<u32, ConnectorMessage>,
}

impl Message {
    #[must_use]
    pub fn new(message_id: i64, channel_id: String, server_id: String) -> Self {
        Self {
            message_id,
            channel_id,
            server_id,
            received_date: SystemTime::now(),
            processed: false,
            connector_messages: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<&ConnectorMessage> {
        self.connector_messages.get(&0)
    }

    pub fn source_mut(&mut self) -> Option<&mut ConnectorMessage> {
        self.connector_messages.get_mut(&0)
    }

    #[must_use]
    pub fn connector_message(&self, metadata_id: u32) -> Option<&ConnectorMessage> {
        self.connector_messages.get(&metadata_id)
    }

    pub fn insert_connector_message(&mut self, connector_message: ConnectorMessage) {
        self.connector_messages.insert(connector_message.metadata_id, connector_message);
    }
}

/// Converts a `SystemTime` to epoch milliseconds for persistence.
#[must_use]
pub fn to_epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Converts persisted epoch milliseconds back to a `SystemTime`.
#[must_use]
pub fn from_epoch_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}

/// Helpers for the destination-set stored in the source map.
///
/// The set is a plain JSON array so operator scripts can mutate it without
/// any host-side helper objects.
pub mod destination_set {
    use super::{ConnectorMap, DESTINATION_NAME_MAP_KEY, DESTINATION_SET_KEY};
    use serde_json::{json, Value as JsonValue};

    /// Seeds the destination set and the name map into a source map.
    pub fn initialize(source_map: &mut ConnectorMap, destinations: &[(u32, String)]) {
        let ids: Vec<JsonValue> = destinations.iter().map(|(id, _)| json!(id)).collect();
        source_map.insert(DESTINATION_SET_KEY.to_string(), JsonValue::Array(ids));

        let mut name_map = serde_json::Map::new();
        for (id, name) in destinations {
            name_map.insert(name.clone(), json!(id));
        }
        source_map.insert(DESTINATION_NAME_MAP_KEY.to_string(), JsonValue::Object(name_map));
    }

    /// Reads the (possibly script-mutated) destination set back out.
    /// Returns `None` when the key is absent or malformed, which callers
    /// treat as "all destinations eligible".
    #[must_use]
    pub fn read(source_map: &ConnectorMap) -> Option<Vec<u32>> {
        let value = source_map.get(DESTINATION_SET_KEY)?;
        let array = value.as_array()?;
        Some(array.iter().filter_map(|v| v.as_u64().and_then(|id| u32::try_from(id).ok())).collect())
    }
}
