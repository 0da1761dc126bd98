// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `${var}` template resolution for connector properties.
//!
//! Tokens resolve against the connector message's channel map, then source
//! map, then connector map, plus the builtins `${message.encodedData}`,
//! `${message.rawData}` and `${message.transformedData}`. Unresolved tokens
//! are left literal, and the original properties are never mutated — the
//! caller receives a resolved copy.

use medbridge_core::{ConnectorMessage, ContentType};
use serde_json::Value as JsonValue;

/// Resolves every `${var}` token in `template` against `message`.
#[must_use]
pub fn resolve(template: &str, message: &ConnectorMessage) -> String {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match lookup(token, message) {
                    Some(value) => resolved.push_str(&value),
                    None => {
                        resolved.push_str("${");
                        resolved.push_str(token);
                        resolved.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unterminated token: keep the remainder literal.
                resolved.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    resolved.push_str(rest);
    resolved
}

fn lookup(token: &str, message: &ConnectorMessage) -> Option<String> {
    match token {
        "message.encodedData" => {
            message.content_str(ContentType::Encoded).map(ToString::to_string)
        }
        "message.rawData" => message.content_str(ContentType::Raw).map(ToString::to_string),
        "message.transformedData" => {
            message.content_str(ContentType::Transformed).map(ToString::to_string)
        }
        key => message
            .channel_map
            .get(key)
            .or_else(|| message.source_map.get(key))
            .or_else(|| message.connector_map.get(key))
            .map(render),
    }
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
