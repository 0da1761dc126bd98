// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in connectors for the Medbridge integration engine.
//!
//! The TCP/MLLP pair exemplifies the connector contract defined in
//! `medbridge-core`:
//! - [`TcpReceiver`]: SERVER or CLIENT mode source with MLLP/FRAME/RAW
//!   framing, batch support, and configurable acknowledgment
//! - [`TcpDispatcher`]: pooled outbound sender with `${var}` templates and
//!   framed response reads
//!
//! Supporting modules: [`framing`] (wire delimiters), [`hl7`] (ACK
//! synthesis, control ids, batch adaptor), [`template`] (`${var}`
//! resolution), [`tls`] (MLLPS), and [`settings`].

pub mod framing;
pub mod hl7;
pub mod settings;
pub mod tcp;
pub mod template;
pub mod tls;

pub use framing::TransmissionMode;
pub use settings::{
    CharsetEncoding, RespondOnNewConnection, ResponseMode, ServerMode, TcpDispatcherSettings,
    TcpReceiverSettings, TransmissionModeKind,
};
pub use tcp::{TcpDispatcher, TcpReceiver};
pub use tls::TlsSettings;
