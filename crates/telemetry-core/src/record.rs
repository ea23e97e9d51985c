// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-observation record emitted toward the log sink (§3, §4.4).

use chrono::{DateTime, Local};

use crate::protocol::MessageKind;

/// The kind carried by a [`Record`]: either one of the twelve wire message
/// kinds, or the synthetic local kind raised by the liveness sweep when a
/// device goes quiet (§4.4). `TIMEOUT_SYNTHETIC` never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Wire(MessageKind),
    TimeoutSynthetic,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Wire(kind) => kind.as_str(),
            RecordKind::TimeoutSynthetic => "TIMEOUT_SYNTHETIC",
        }
    }
}

/// One processed observation, ready for the log sink.
///
/// `device_timestamp` and `arrival_time` are both local-time stamps (§6):
/// the former derived from the device's announced base time, the latter
/// the collector's own wall clock at receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub message_kind: RecordKind,
    pub device_id: u16,
    pub sequence: u16,
    pub device_timestamp: DateTime<Local>,
    pub arrival_time: DateTime<Local>,
    pub value: Option<i16>,
    pub duplicate_flag: bool,
    pub gap_flag: bool,
    pub delayed_flag: bool,
    /// Set when a data message was processed without the device ever
    /// having a prior keyframe (delta arriving before any KEYFRAME) or
    /// an unknown device_id reused a live MAC (§4.4 transitions, §7).
    pub protocol_violation: bool,
    /// Set when a data message arrived in PENDING before any TIME_SYNC;
    /// `device_timestamp` falls back to `arrival_time` in that case (§4.4).
    pub pre_sync_flag: bool,
    pub cpu_time_ms: f64,
}

impl Record {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_kind: RecordKind,
        device_id: u16,
        sequence: u16,
        device_timestamp: DateTime<Local>,
        arrival_time: DateTime<Local>,
        value: Option<i16>,
    ) -> Self {
        Self {
            message_kind,
            device_id,
            sequence,
            device_timestamp,
            arrival_time,
            value,
            duplicate_flag: false,
            gap_flag: false,
            delayed_flag: false,
            protocol_violation: false,
            pre_sync_flag: false,
            cpu_time_ms: 0.0,
        }
    }
}
