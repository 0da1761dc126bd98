// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Message storage gating.
//!
//! A channel's storage mode is a named preset; the flag combination it maps
//! to is deterministic. The pipeline consults individual flags before
//! persisting each content slot, so a mode change only ever affects what is
//! written, never the in-memory flow.

use serde::{Deserialize, Serialize};

/// Named storage presets, from everything to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageMode {
    /// All content slots and maps are persisted.
    Development,
    /// Skip intermediate content (processed raw, transformed); keep raw,
    /// encoded, sent, responses, and maps.
    #[default]
    Production,
    /// Only raw content and metadata rows.
    Raw,
    /// Metadata rows only, no content.
    Metadata,
    /// Nothing is persisted; the channel runs in-memory.
    Disabled,
}

/// Resolved persistence flags for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Master switch; false short-circuits every store call.
    pub enabled: bool,
    pub store_raw: bool,
    pub store_processed_raw: bool,
    pub store_transformed: bool,
    pub store_encoded: bool,
    pub store_sent: bool,
    pub store_response: bool,
    pub store_response_transformed: bool,
    pub store_processed_response: bool,
    pub store_maps: bool,
    pub store_response_map: bool,
    pub store_custom_metadata: bool,
    pub remove_content_on_completion: bool,
    pub remove_only_filtered_on_completion: bool,
    pub remove_attachments_on_completion: bool,
    pub message_recovery_enabled: bool,
    /// Commit the raw content before any processing happens (T1).
    pub raw_durable: bool,
    /// Commit every later phase (T2-T4) as it happens.
    pub durable: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self::from_mode(StorageMode::default())
    }
}

impl StorageSettings {
    /// Expands a named mode into its deterministic flag combination.
    #[must_use]
    pub fn from_mode(mode: StorageMode) -> Self {
        match mode {
            StorageMode::Development => Self {
                enabled: true,
                store_raw: true,
                store_processed_raw: true,
                store_transformed: true,
                store_encoded: true,
                store_sent: true,
                store_response: true,
                store_response_transformed: true,
                store_processed_response: true,
                store_maps: true,
                store_response_map: true,
                store_custom_metadata: true,
                remove_content_on_completion: false,
                remove_only_filtered_on_completion: false,
                remove_attachments_on_completion: false,
                message_recovery_enabled: true,
                raw_durable: true,
                durable: true,
            },
            StorageMode::Production => Self {
                store_processed_raw: false,
                store_transformed: false,
                store_response_transformed: false,
                store_processed_response: false,
                ..Self::from_mode(StorageMode::Development)
            },
            StorageMode::Raw => Self {
                enabled: true,
                store_raw: true,
                store_processed_raw: false,
                store_transformed: false,
                store_encoded: false,
                store_sent: false,
                store_response: false,
                store_response_transformed: false,
                store_processed_response: false,
                store_maps: false,
                store_response_map: false,
                store_custom_metadata: false,
                remove_content_on_completion: false,
                remove_only_filtered_on_completion: false,
                remove_attachments_on_completion: false,
                message_recovery_enabled: true,
                raw_durable: true,
                durable: false,
            },
            StorageMode::Metadata => Self {
                store_raw: false,
                raw_durable: false,
                message_recovery_enabled: false,
                ..Self::from_mode(StorageMode::Raw)
            },
            StorageMode::Disabled => Self {
                enabled: false,
                ..Self::from_mode(StorageMode::Metadata)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_stores_everything() {
        let s = StorageSettings::from_mode(StorageMode::Development);
        assert!(s.enabled && s.store_raw && s.store_processed_raw && s.store_transformed);
        assert!(s.store_encoded && s.store_sent && s.store_response && s.store_maps);
        assert!(s.durable && s.raw_durable && s.message_recovery_enabled);
    }

    #[test]
    fn test_production_skips_intermediate_content() {
        let s = StorageSettings::from_mode(StorageMode::Production);
        assert!(s.enabled && s.store_raw && s.store_encoded && s.store_sent);
        assert!(!s.store_processed_raw);
        assert!(!s.store_transformed);
        assert!(!s.store_response_transformed);
    }

    #[test]
    fn test_raw_keeps_only_raw() {
        let s = StorageSettings::from_mode(StorageMode::Raw);
        assert!(s.enabled && s.store_raw);
        assert!(!s.store_encoded && !s.store_sent && !s.store_maps);
    }

    #[test]
    fn test_metadata_and_disabled() {
        let metadata = StorageSettings::from_mode(StorageMode::Metadata);
        assert!(metadata.enabled);
        assert!(!metadata.store_raw);

        let disabled = StorageSettings::from_mode(StorageMode::Disabled);
        assert!(!disabled.enabled);
    }
}
