// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the Medbridge runtime.
//!
//! This module provides a hierarchy of error types for better error handling
//! and programmatic error inspection. All errors implement `Display` and can
//! be converted to/from `String` for backward compatibility.

use thiserror::Error;

/// Main error type for engine operations.
///
/// This enum categorizes errors into distinct types to enable better error
/// handling, logging, and recovery strategies. Each variant includes a
/// descriptive message.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - A destination configured to respond on a new connection without a
    ///   response address/port
    /// - An unknown transmission mode or storage mode
    /// - A channel definition referencing a missing script
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime processing error during normal operation.
    ///
    /// Examples:
    /// - An illegal channel state transition
    /// - A dispatch attempted against a stopped channel
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Network-related error (sockets, framing, TLS).
    ///
    /// Examples:
    /// - Connection refused or reset
    /// - Timeout waiting for a framed response
    #[error("Network error: {0}")]
    Network(String),

    /// Operator script execution error (filter, transformer, lifecycle).
    #[error("Script error: {0}")]
    Script(String),

    /// Durable store error. The pipeline itself never propagates these; they
    /// surface only from lifecycle operations such as table registration.
    #[error("Store error: {0}")]
    Store(String),

    /// I/O error (file operations, socket primitives).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

// Backward compatibility: Allow conversion from EngineError to String
impl From<EngineError> for String {
    fn from(err: EngineError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to the Runtime variant
impl From<String> for EngineError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
