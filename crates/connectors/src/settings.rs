// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Operator-facing settings for the TCP connectors.

use crate::framing::{parse_hex_bytes, TransmissionMode};
use crate::tls::TlsSettings;
use medbridge_core::{DataType, EngineError, Result};
use serde::{Deserialize, Serialize};

/// Whether the receiver binds and listens or connects out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMode {
    #[default]
    Server,
    Client,
}

/// Framing mode selector; FRAME reads the operator byte sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransmissionModeKind {
    #[default]
    Mllp,
    Frame,
    Raw,
}

/// What the receiver writes back after a message is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseMode {
    None,
    /// Synthesize an HL7 ACK: AA on all-sent, AE on any destination error,
    /// AR on source filtered.
    #[default]
    Auto,
    /// Propagate the first destination's response.
    Destination,
}

/// Where the receiver writes the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RespondOnNewConnection {
    /// Same socket the message arrived on.
    #[default]
    Disabled,
    /// Always open a fresh socket to `response_address:response_port`.
    NewConnection,
    /// Same socket normally; a fresh socket only for recovered messages.
    NewConnectionOnRecovery,
}

/// Payload charset. The wire side of the connectors is byte-oriented; this
/// governs the bytes ↔ string conversion at the framing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CharsetEncoding {
    #[serde(rename = "UTF-8")]
    #[default]
    Utf8,
    #[serde(rename = "ISO-8859-1")]
    Latin1,
}

impl CharsetEncoding {
    /// Decodes received bytes into the payload string.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    /// Encodes a payload string for the wire.
    #[must_use]
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Latin1 => text.chars().map(|c| if (c as u32) < 256 { c as u8 } else { b'?' }).collect(),
        }
    }
}

/// TCP source connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpReceiverSettings {
    pub server_mode: ServerMode,
    pub host: String,
    pub port: u16,
    pub transmission_mode: TransmissionModeKind,
    pub start_of_message_bytes: String,
    pub end_of_message_bytes: String,
    pub charset_encoding: CharsetEncoding,
    /// 0 disables the read timeout.
    pub receive_timeout_ms: u64,
    pub keep_connection_open: bool,
    pub max_connections: usize,
    pub response_mode: ResponseMode,
    pub respond_on_new_connection: RespondOnNewConnection,
    pub response_address: Option<String>,
    pub response_port: Option<u16>,
    pub data_type: DataType,
    /// Subdivide arrivals containing multiple MSH-led messages.
    pub process_batch: bool,
    /// CLIENT mode: delay between reconnect attempts.
    pub reconnect_interval_ms: u64,
    pub buffer_size: usize,
    /// SERVER mode: retries on EADDRINUSE before surfacing the error.
    pub bind_retry_attempts: u32,
    pub bind_retry_interval_ms: u64,
    pub tls: Option<TlsSettings>,
}

impl Default for TcpReceiverSettings {
    fn default() -> Self {
        Self {
            server_mode: ServerMode::Server,
            host: "0.0.0.0".to_string(),
            port: 6661,
            transmission_mode: TransmissionModeKind::Mllp,
            start_of_message_bytes: String::new(),
            end_of_message_bytes: String::new(),
            charset_encoding: CharsetEncoding::Utf8,
            receive_timeout_ms: 0,
            keep_connection_open: true,
            max_connections: 10,
            response_mode: ResponseMode::Auto,
            respond_on_new_connection: RespondOnNewConnection::Disabled,
            response_address: None,
            response_port: None,
            data_type: DataType::Hl7v2,
            process_batch: false,
            reconnect_interval_ms: 5_000,
            buffer_size: 65_536,
            bind_retry_attempts: 3,
            bind_retry_interval_ms: 1_000,
            tls: None,
        }
    }
}

impl TcpReceiverSettings {
    /// Expands the framing selector into a concrete transmission mode.
    pub fn resolved_transmission_mode(&self) -> Result<TransmissionMode> {
        resolve_transmission_mode(
            self.transmission_mode,
            &self.start_of_message_bytes,
            &self.end_of_message_bytes,
        )
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.respond_on_new_connection == RespondOnNewConnection::NewConnection
            && (self.response_address.as_deref().is_none_or(str::is_empty)
                || self.response_port.is_none())
        {
            return Err(EngineError::Configuration(
                "respond on new connection requires a response address and port".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(EngineError::Configuration(
                "max connections must be at least 1".to_string(),
            ));
        }
        self.resolved_transmission_mode().map(|_| ())
    }
}

/// TCP destination connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpDispatcherSettings {
    pub host: String,
    pub port: u16,
    pub local_address: Option<String>,
    pub local_port: Option<u16>,
    pub transmission_mode: TransmissionModeKind,
    pub start_of_message_bytes: String,
    pub end_of_message_bytes: String,
    pub charset_encoding: CharsetEncoding,
    /// Idle time after which pooled sockets are closed by the reaper.
    pub send_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub keep_connection_open: bool,
    /// Resolve and verify the remote host before each send.
    pub check_remote_host: bool,
    pub ignore_response: bool,
    /// Response read timeouts convert to QUEUED instead of ERROR.
    pub queue_on_response_timeout: bool,
    /// Outbound payload template; defaults to the encoded content.
    pub template: String,
    pub data_type: DataType,
    pub buffer_size: usize,
    /// Connect timeout.
    pub socket_timeout_ms: u64,
    pub tls: Option<TlsSettings>,
}

impl Default for TcpDispatcherSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6660,
            local_address: None,
            local_port: None,
            transmission_mode: TransmissionModeKind::Mllp,
            start_of_message_bytes: String::new(),
            end_of_message_bytes: String::new(),
            charset_encoding: CharsetEncoding::Utf8,
            send_timeout_ms: 5_000,
            response_timeout_ms: 5_000,
            keep_connection_open: false,
            check_remote_host: false,
            ignore_response: false,
            queue_on_response_timeout: false,
            template: "${message.encodedData}".to_string(),
            data_type: DataType::Hl7v2,
            buffer_size: 65_536,
            socket_timeout_ms: 5_000,
            tls: None,
        }
    }
}

impl TcpDispatcherSettings {
    pub fn resolved_transmission_mode(&self) -> Result<TransmissionMode> {
        resolve_transmission_mode(
            self.transmission_mode,
            &self.start_of_message_bytes,
            &self.end_of_message_bytes,
        )
    }
}

fn resolve_transmission_mode(
    kind: TransmissionModeKind,
    start: &str,
    end: &str,
) -> Result<TransmissionMode> {
    match kind {
        TransmissionModeKind::Mllp => Ok(TransmissionMode::Mllp),
        TransmissionModeKind::Raw => Ok(TransmissionMode::Raw),
        TransmissionModeKind::Frame => Ok(TransmissionMode::Frame {
            start: parse_hex_bytes(start)?,
            end: parse_hex_bytes(end)?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_requires_address_and_port() {
        let mut settings = TcpReceiverSettings {
            respond_on_new_connection: RespondOnNewConnection::NewConnection,
            ..TcpReceiverSettings::default()
        };
        assert!(settings.validate().is_err());

        settings.response_address = Some("127.0.0.1".to_string());
        assert!(settings.validate().is_err());

        settings.response_port = Some(6670);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_frame_mode_resolution() {
        let settings = TcpReceiverSettings {
            transmission_mode: TransmissionModeKind::Frame,
            start_of_message_bytes: "02".to_string(),
            end_of_message_bytes: "030D".to_string(),
            ..TcpReceiverSettings::default()
        };
        let mode = settings.resolved_transmission_mode().expect("valid frame mode");
        assert_eq!(
            mode,
            TransmissionMode::Frame { start: vec![0x02], end: vec![0x03, 0x0D] }
        );
    }

    #[test]
    fn test_charset_round_trip() {
        let text = "MSH|é";
        assert_eq!(CharsetEncoding::Utf8.decode(&CharsetEncoding::Utf8.encode(text)), text);
        assert_eq!(CharsetEncoding::Latin1.decode(&CharsetEncoding::Latin1.encode(text)), text);
    }
}
