// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! HL7 v2 helpers: acknowledgment synthesis, control-id extraction,
//! response validation, and the batch adaptor.

use medbridge_core::{Message, Status};
use time::OffsetDateTime;

/// HL7 acknowledgment codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// AA: application accept.
    Accept,
    /// AE: application error.
    Error,
    /// AR: application reject.
    Reject,
}

impl AckCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "AA",
            Self::Error => "AE",
            Self::Reject => "AR",
        }
    }

    /// Derives the code from a dispatched message: AR when the source was
    /// filtered, AE when the source or any destination errored, AA
    /// otherwise.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let source_status = message.source().map(|s| s.status);
        if source_status == Some(Status::Filtered) {
            return Self::Reject;
        }
        if source_status == Some(Status::Error) {
            return Self::Error;
        }
        let any_destination_error = message
            .connector_messages
            .iter()
            .any(|(metadata_id, cm)| *metadata_id > 0 && cm.status == Status::Error);
        if any_destination_error {
            Self::Error
        } else {
            Self::Accept
        }
    }
}

/// Extracts MSH-10 (message control id) from a raw HL7 payload.
#[must_use]
pub fn message_control_id(raw: &str) -> Option<&str> {
    let first_segment = raw.split(['\r', '\n']).next()?;
    if !first_segment.starts_with("MSH") {
        return None;
    }
    first_segment.split('|').nth(9).filter(|id| !id.is_empty())
}

/// Synthesizes an HL7 acknowledgment for AUTO response mode:
/// `MSH|^~\&|MIRTH|MIRTH|MIRTH|MIRTH|<ts>||ACK|<controlId>|P|2.5\rMSA|<code>|<controlId>|\r`
#[must_use]
pub fn generate_ack(code: AckCode, control_id: &str) -> String {
    let now = OffsetDateTime::now_utc();
    let timestamp = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    );
    format!(
        "MSH|^~\\&|MIRTH|MIRTH|MIRTH|MIRTH|{timestamp}||ACK|{control_id}|P|2.5\rMSA|{}|{control_id}|\r",
        code.as_str()
    )
}

/// Reads the MSA-1 acknowledgment code out of a response payload. Returns
/// `None` when the response has no MSA segment.
#[must_use]
pub fn ack_code_of_response(response: &str) -> Option<&str> {
    response
        .split(['\r', '\n'])
        .find(|segment| segment.starts_with("MSA"))
        .and_then(|segment| segment.split('|').nth(1))
        .filter(|code| !code.is_empty())
}

/// Whether an HL7 response acknowledges success (MSA-1 of AA or CA).
/// A response without an MSA segment is not considered a rejection.
#[must_use]
pub fn response_accepted(response: &str) -> bool {
    ack_code_of_response(response).is_none_or(|code| matches!(code, "AA" | "CA"))
}

/// Batch adaptor: subdivides one arrival containing multiple MSH-led
/// messages into individual messages, delivered sequentially by the caller.
/// Batch envelope segments (FHS/BHS/BTS/FTS) are dropped.
#[must_use]
pub fn split_batch(raw: &str) -> Vec<String> {
    let mut messages: Vec<Vec<&str>> = Vec::new();
    for segment in raw.split(['\r', '\n']).filter(|s| !s.is_empty()) {
        let id = segment.get(..3).unwrap_or_default();
        if matches!(id, "FHS" | "BHS" | "BTS" | "FTS") {
            continue;
        }
        if id == "MSH" {
            messages.push(vec![segment]);
        } else if let Some(current) = messages.last_mut() {
            current.push(segment);
        }
        // Segments before the first MSH are dropped.
    }
    messages.into_iter().map(|segments| segments.join("\r")).collect()
}
