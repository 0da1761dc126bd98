// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Attachment extraction interface.
//!
//! Before the source intake transaction, the channel hands the raw payload
//! to its attachment handler. The handler may pull large embedded content
//! (e.g. base64 images in OBX segments) out into attachment rows and return
//! a modified payload with placeholder tokens; the modified payload then
//! replaces RAW for the rest of the pipeline.

use crate::error::Result;
use async_trait::async_trait;

/// One extracted attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// Result of running attachment extraction over a raw payload.
#[derive(Debug, Clone, Default)]
pub struct AttachmentExtraction {
    /// Replacement raw content, when extraction changed the payload.
    pub modified_content: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Pluggable attachment extraction.
#[async_trait]
pub trait AttachmentHandler: Send + Sync {
    async fn extract(&self, channel_id: &str, raw: &str) -> Result<AttachmentExtraction>;
}

/// Handler that extracts nothing. The default for channels without an
/// attachment policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughAttachmentHandler;

#[async_trait]
impl AttachmentHandler for PassthroughAttachmentHandler {
    async fn extract(&self, _channel_id: &str, _raw: &str) -> Result<AttachmentExtraction> {
        Ok(AttachmentExtraction::default())
    }
}
