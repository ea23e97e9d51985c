// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed 8-byte datagram header and the message-kind code table.

/// Current (and only) supported protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size in bytes of the wire header.
pub const HEADER_LEN: usize = 8;

/// Tagged message kinds, in their default wire-code order (§3).
///
/// The low nibble of `version_and_type` carries the numeric value of this
/// enum. `MessageKind::from_code`/`to_code` are the thin indirection the
/// design notes call for — a test harness can substitute a different
/// mapping without touching the codec's control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Startup,
    StartupAck,
    TimeSync,
    Keyframe,
    DataDelta,
    Heartbeat,
    BatchedData,
    DataDeltaQuantized,
    KeyframeQuantized,
    BatchedDataQuantized,
    Shutdown,
    BatchIncomplete,
}

impl MessageKind {
    /// Default code mapping (§3). Codes 0-11 fit the header's low nibble.
    pub fn to_code(self) -> u8 {
        match self {
            Self::Startup => 0,
            Self::StartupAck => 1,
            Self::TimeSync => 2,
            Self::Keyframe => 3,
            Self::DataDelta => 4,
            Self::Heartbeat => 5,
            Self::BatchedData => 6,
            Self::DataDeltaQuantized => 7,
            Self::KeyframeQuantized => 8,
            Self::BatchedDataQuantized => 9,
            Self::Shutdown => 10,
            Self::BatchIncomplete => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Startup,
            1 => Self::StartupAck,
            2 => Self::TimeSync,
            3 => Self::Keyframe,
            4 => Self::DataDelta,
            5 => Self::Heartbeat,
            6 => Self::BatchedData,
            7 => Self::DataDeltaQuantized,
            8 => Self::KeyframeQuantized,
            9 => Self::BatchedDataQuantized,
            10 => Self::Shutdown,
            11 => Self::BatchIncomplete,
            _ => return None,
        })
    }

    /// Reserved message kinds with unspecified quantization semantics (§9).
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::DataDeltaQuantized | Self::KeyframeQuantized | Self::BatchedDataQuantized
        )
    }

    /// Whether this kind carries a real sequence number (§4.4 step 4):
    /// STARTUP/STARTUP_ACK/TIME_SYNC use sequence 0 by convention instead.
    pub fn is_classified(self) -> bool {
        !matches!(self, Self::Startup | Self::StartupAck | Self::TimeSync)
    }

    /// Stable lowercase name, used by the log sink (§6) rather than
    /// `{:?}`'s CamelCase so on-disk records read like the wire names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "STARTUP",
            Self::StartupAck => "STARTUP_ACK",
            Self::TimeSync => "TIME_SYNC",
            Self::Keyframe => "KEYFRAME",
            Self::DataDelta => "DATA_DELTA",
            Self::Heartbeat => "HEARTBEAT",
            Self::BatchedData => "BATCHED_DATA",
            Self::DataDeltaQuantized => "DATA_DELTA_QUANTIZED",
            Self::KeyframeQuantized => "KEYFRAME_QUANTIZED",
            Self::BatchedDataQuantized => "BATCHED_DATA_QUANTIZED",
            Self::Shutdown => "SHUTDOWN",
            Self::BatchIncomplete => "BATCH_INCOMPLETE",
        }
    }
}

/// The 8-byte datagram header, decoded into native fields (big-endian on
/// the wire throughout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: MessageKind,
    pub device_id: u16,
    pub sequence: u16,
    pub time_offset: u16,
    pub payload_length: u8,
}

impl Header {
    pub fn new(
        kind: MessageKind,
        device_id: u16,
        sequence: u16,
        time_offset: u16,
        payload_length: u8,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            device_id,
            sequence,
            time_offset,
            payload_length,
        }
    }

    pub fn write_to(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = (self.version << 4) | (self.kind.to_code() & 0x0f);
        buf[1..3].copy_from_slice(&self.device_id.to_be_bytes());
        buf[3..5].copy_from_slice(&self.sequence.to_be_bytes());
        buf[5..7].copy_from_slice(&self.time_offset.to_be_bytes());
        buf[7] = self.payload_length;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip_covers_all_kinds() {
        let kinds = [
            MessageKind::Startup,
            MessageKind::StartupAck,
            MessageKind::TimeSync,
            MessageKind::Keyframe,
            MessageKind::DataDelta,
            MessageKind::Heartbeat,
            MessageKind::BatchedData,
            MessageKind::DataDeltaQuantized,
            MessageKind::KeyframeQuantized,
            MessageKind::BatchedDataQuantized,
            MessageKind::Shutdown,
            MessageKind::BatchIncomplete,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::from_code(kind.to_code()), Some(kind));
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert_eq!(MessageKind::from_code(12), None);
        assert_eq!(MessageKind::from_code(255), None);
    }

    #[test]
    fn reserved_kinds_flagged() {
        assert!(MessageKind::DataDeltaQuantized.is_reserved());
        assert!(!MessageKind::Keyframe.is_reserved());
    }

    #[test]
    fn header_write_packs_version_and_type() {
        let header = Header::new(MessageKind::DataDelta, 7, 42, 1000, 1);
        let mut buf = [0u8; HEADER_LEN];
        header.write_to(&mut buf);
        assert_eq!(buf[0], (1 << 4) | 4);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 7);
        assert_eq!(u16::from_be_bytes([buf[3], buf[4]]), 42);
        assert_eq!(u16::from_be_bytes([buf[5], buf[6]]), 1000);
        assert_eq!(buf[7], 1);
    }
}
