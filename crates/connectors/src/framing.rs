// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wire framing for the TCP connectors.
//!
//! Three modes:
//! - MLLP: payload between VT (0x0B) and FS+CR (0x1C 0x0D), HL7's standard
//!   lower layer framing
//! - FRAME: operator-supplied start/end byte sequences
//! - RAW: no framing at all; any non-empty buffer is a complete message
//!
//! Malformed bytes are never an error here: a buffer without a complete
//! frame simply scans as incomplete and stays buffered. A socket closing
//! mid-frame discards its buffer at the call site.

use medbridge_core::{EngineError, Result};

pub const VT: u8 = 0x0B;
pub const FS: u8 = 0x1C;
pub const CR: u8 = 0x0D;

/// A complete frame located inside a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMatch {
    /// Byte range of the payload, start/end sequences excluded.
    pub payload: std::ops::Range<usize>,
    /// Bytes to advance the buffer past this frame.
    pub consumed: usize,
}

/// How payloads are delimited on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionMode {
    Mllp,
    Frame { start: Vec<u8>, end: Vec<u8> },
    Raw,
}

impl TransmissionMode {
    #[must_use]
    pub fn start_bytes(&self) -> &[u8] {
        match self {
            Self::Mllp => &[VT],
            Self::Frame { start, .. } => start,
            Self::Raw => &[],
        }
    }

    #[must_use]
    pub fn end_bytes(&self) -> &[u8] {
        match self {
            Self::Mllp => &[FS, CR],
            Self::Frame { end, .. } => end,
            Self::Raw => &[],
        }
    }

    /// Wraps a payload in this mode's start/end sequences.
    #[must_use]
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let start = self.start_bytes();
        let end = self.end_bytes();
        let mut framed = Vec::with_capacity(start.len() + payload.len() + end.len());
        framed.extend_from_slice(start);
        framed.extend_from_slice(payload);
        framed.extend_from_slice(end);
        framed
    }

    /// Strips this mode's start/end sequences from a complete frame.
    /// Returns `None` when the input is not a complete frame.
    #[must_use]
    pub fn unframe<'a>(&self, framed: &'a [u8]) -> Option<&'a [u8]> {
        let m = self.scan(framed)?;
        Some(&framed[m.payload])
    }

    /// Locates the first complete frame in a receive buffer.
    ///
    /// "Has complete message" is: MLLP — an FS followed by CR; FRAME — the
    /// end sequence present after the start sequence; RAW — buffer
    /// non-empty (the whole buffer is the message).
    #[must_use]
    pub fn scan(&self, buf: &[u8]) -> Option<FrameMatch> {
        if buf.is_empty() {
            return None;
        }
        if matches!(self, Self::Raw) {
            return Some(FrameMatch { payload: 0..buf.len(), consumed: buf.len() });
        }

        let start = self.start_bytes();
        let end = self.end_bytes();

        let payload_start = if start.is_empty() {
            0
        } else {
            find_subsequence(buf, start)? + start.len()
        };
        if end.is_empty() {
            // No end delimiter configured: treat like RAW past the start
            // sequence.
            return Some(FrameMatch { payload: payload_start..buf.len(), consumed: buf.len() });
        }

        let end_offset = find_subsequence(&buf[payload_start..], end)?;
        let payload_end = payload_start + end_offset;
        Some(FrameMatch { payload: payload_start..payload_end, consumed: payload_end + end.len() })
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Parses an operator-supplied byte-sequence string ("0B", "1C0D", "0x0B 0x0D")
/// into raw bytes.
pub fn parse_hex_bytes(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .split_whitespace()
        .map(|token| token.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if cleaned.is_empty() {
        return Ok(Vec::new());
    }
    if cleaned.len() % 2 != 0 {
        return Err(EngineError::Configuration(format!(
            "byte sequence '{input}' has an odd number of hex digits"
        )));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16).map_err(|_| {
                EngineError::Configuration(format!("byte sequence '{input}' is not valid hex"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_mode() -> TransmissionMode {
        TransmissionMode::Frame { start: vec![0x02], end: vec![0x03, 0x0D] }
    }

    #[test]
    fn test_round_trip_all_modes() {
        let payload = b"MSH|^~\\&|A|B|C|D|20260101||ADT^A01|42|P|2.5";
        for mode in [TransmissionMode::Mllp, frame_mode(), TransmissionMode::Raw] {
            let framed = mode.frame(payload);
            assert_eq!(mode.unframe(&framed), Some(payload.as_slice()), "mode {mode:?}");
        }
    }

    #[test]
    fn test_mllp_scan_incomplete() {
        let mode = TransmissionMode::Mllp;
        assert_eq!(mode.scan(b""), None);
        assert_eq!(mode.scan(&[VT]), None);
        assert_eq!(mode.scan(&[VT, b'A', b'B']), None);
        // FS without trailing CR is not a complete message
        assert_eq!(mode.scan(&[VT, b'A', FS]), None);
    }

    #[test]
    fn test_mllp_scan_boundary() {
        // S6: a complete frame followed by the start of another
        let mut buf = Vec::new();
        buf.extend_from_slice(&[VT]);
        buf.extend_from_slice(b"AAA");
        buf.extend_from_slice(&[FS, CR, VT]);
        buf.extend_from_slice(b"BB");

        let m = TransmissionMode::Mllp.scan(&buf).expect("complete frame");
        assert_eq!(&buf[m.payload.clone()], b"AAA");
        assert_eq!(m.consumed, 6);

        // The remainder has no complete frame
        assert_eq!(TransmissionMode::Mllp.scan(&buf[m.consumed..]), None);
    }

    #[test]
    fn test_raw_scan_takes_whole_buffer() {
        let m = TransmissionMode::Raw.scan(b"anything").expect("non-empty");
        assert_eq!(m.payload, 0..8);
        assert_eq!(m.consumed, 8);
        assert_eq!(TransmissionMode::Raw.scan(b""), None);
    }

    #[test]
    fn test_frame_mode_skips_leading_garbage() {
        let mode = frame_mode();
        let mut buf = vec![0xFF, 0xFE];
        buf.extend_from_slice(&mode.frame(b"payload"));
        let m = mode.scan(&buf).expect("frame after garbage");
        assert_eq!(&buf[m.payload.clone()], b"payload");
        assert_eq!(m.consumed, buf.len());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("0B").expect("valid"), vec![0x0B]);
        assert_eq!(parse_hex_bytes("1C0D").expect("valid"), vec![0x1C, 0x0D]);
        assert_eq!(parse_hex_bytes("0x1C 0x0D").expect("valid"), vec![0x1C, 0x0D]);
        assert_eq!(parse_hex_bytes("").expect("empty ok"), Vec::<u8>::new());
        assert!(parse_hex_bytes("0B0").is_err());
        assert!(parse_hex_bytes("ZZ").is_err());
    }
}
