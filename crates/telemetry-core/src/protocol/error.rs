// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Codec decode error taxonomy (§4.1, §7).

use thiserror::Error;

/// Reasons a datagram can be rejected before it ever touches device state.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("datagram shorter than the 8-byte header")]
    Short,

    #[error("unsupported protocol version {found}")]
    VersionMismatch { found: u8 },

    #[error("unknown message type code {code:#x}")]
    UnknownType { code: u8 },

    #[error("payload_length {declared} does not match actual payload size {actual}")]
    PayloadLengthMismatch { declared: u8, actual: usize },

    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("batch entry malformed: {reason}")]
    BatchEntryMalformed { reason: String },
}
