// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device receive state machine (§4.4).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Local, TimeZone};

use crate::device::DeviceStatus;
use crate::device_table::DeviceTable;
use crate::protocol::{self, BatchEntryValue, Header, MessageKind, Payload};
use crate::record::{Record, RecordKind};
use crate::sink::RecordSink;
use crate::tracker::Classification;

/// A datagram the I/O loop must send back to `to` (§4.4: STARTUP_ACK is
/// emitted synchronously from within datagram processing).
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Drives every device's receive state machine and owns the shared
/// [`DeviceTable`] and log sink for one collector instance (§4.4, §5).
pub struct ServerSession<S: RecordSink> {
    devices: DeviceTable,
    sink: S,
    decode_errors: AtomicU64,
    dropped_unknown_device: AtomicU64,
}

impl<S: RecordSink> ServerSession<S> {
    pub fn new(sink: S) -> Self {
        Self {
            devices: DeviceTable::new(),
            sink,
            decode_errors: AtomicU64::new(0),
            dropped_unknown_device: AtomicU64::new(0),
        }
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn decode_error_count(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn dropped_unknown_device_count(&self) -> u64 {
        self.dropped_unknown_device.load(Ordering::Relaxed)
    }

    /// Process one raw datagram received from `source` at `wall_now`
    /// (§4.4 steps 1-7). Returns any datagrams the I/O loop should send
    /// back (only STARTUP_ACK, today).
    pub fn process_datagram(
        &self,
        bytes: &[u8],
        source: SocketAddr,
        wall_now: DateTime<Local>,
    ) -> Vec<Outgoing> {
        let start = Instant::now();

        let (header, payload) = match protocol::decode_datagram(bytes) {
            Ok(v) => v,
            Err(err) => {
                log::debug!("dropping datagram from {source}: {err}");
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };

        match header.kind {
            MessageKind::Startup => self.handle_startup(&header, &payload, source, wall_now, start),
            _ => self.handle_known_device(&header, &payload, wall_now, start),
        }
    }

    /// Registration path: allocate or recognize a device and reply with
    /// STARTUP_ACK synchronously (§4.3, §4.4 transitions).
    fn handle_startup(
        &self,
        header: &Header,
        payload: &Payload,
        source: SocketAddr,
        wall_now: DateTime<Local>,
        start: Instant,
    ) -> Vec<Outgoing> {
        let (mac, batch_size) = match payload {
            Payload::Startup { mac, batch_size } => (*mac, batch_size.unwrap_or(1)),
            _ => return Vec::new(),
        };

        let registration = self.devices.register(mac, batch_size);

        if let Some(entry) = self.devices.lookup_by_id(registration.device_id) {
            let mut device = entry.lock();
            device.status = DeviceStatus::Pending;
        }

        let ack_payload = if registration.is_reconnection {
            Payload::StartupAck {
                device_id: registration.device_id,
                last_known_sequence: Some(registration.last_known_sequence.unwrap_or(0)),
            }
        } else {
            Payload::StartupAck {
                device_id: registration.device_id,
                last_known_sequence: None,
            }
        };
        let ack_bytes = ack_payload.encode();
        let ack_header = Header::new(
            MessageKind::StartupAck,
            registration.device_id,
            0,
            0,
            ack_bytes.len() as u8,
        );
        let reply = protocol::encode_datagram(&ack_header, &ack_payload);

        let mut record = Record::new(
            RecordKind::Wire(MessageKind::Startup),
            registration.device_id,
            0,
            wall_now,
            wall_now,
            None,
        );
        record.cpu_time_ms = elapsed_ms(start);
        self.emit(record);

        vec![Outgoing {
            to: source,
            bytes: reply,
        }]
    }

    fn handle_known_device(
        &self,
        header: &Header,
        payload: &Payload,
        wall_now: DateTime<Local>,
        start: Instant,
    ) -> Vec<Outgoing> {
        let entry = match self.devices.lookup_by_id(header.device_id) {
            Some(e) => e,
            None => {
                self.dropped_unknown_device.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };
        let mut device = entry.lock();

        device.note_arrival(Instant::now());

        let (classification, gap_flag) = if header.kind.is_classified() {
            let c = device.tracker.classify(header.sequence);
            let gap = device.tracker.last_call_opened_gap();
            (c, gap)
        } else {
            (Classification::Normal, false)
        };
        let duplicate_flag = matches!(
            classification,
            Classification::Duplicate | Classification::OutOfWindow
        );
        let delayed_flag = matches!(classification, Classification::Delayed);
        let updates_state = classification.updates_state();

        let pre_sync = device.status == DeviceStatus::Pending
            && device.base_time.is_none()
            && is_data_message(header.kind);

        let mut records = Vec::new();

        match (header.kind, payload) {
            (MessageKind::Keyframe, Payload::Keyframe { value }) => {
                if updates_state {
                    device.last_value = Some(*value);
                }
                let (timestamp, pre_sync) =
                    resolve_timestamp(device.base_time, header.time_offset, wall_now, pre_sync);
                records.push(build_record(
                    RecordKind::Wire(MessageKind::Keyframe),
                    header,
                    timestamp,
                    wall_now,
                    device.last_value,
                    duplicate_flag,
                    gap_flag,
                    delayed_flag,
                    false,
                    pre_sync,
                ));
            }
            (MessageKind::DataDelta, Payload::DataDelta { delta }) => {
                let mut protocol_violation = false;
                if updates_state {
                    match device.last_value {
                        Some(v) => device.last_value = Some(v.wrapping_add(*delta as i16)),
                        None => protocol_violation = true,
                    }
                }
                let (timestamp, pre_sync) =
                    resolve_timestamp(device.base_time, header.time_offset, wall_now, pre_sync);
                records.push(build_record(
                    RecordKind::Wire(MessageKind::DataDelta),
                    header,
                    timestamp,
                    wall_now,
                    device.last_value,
                    duplicate_flag,
                    gap_flag,
                    delayed_flag,
                    protocol_violation,
                    pre_sync,
                ));
            }
            (MessageKind::Heartbeat, Payload::Heartbeat) => {
                let (timestamp, pre_sync) =
                    resolve_timestamp(device.base_time, header.time_offset, wall_now, pre_sync);
                records.push(build_record(
                    RecordKind::Wire(MessageKind::Heartbeat),
                    header,
                    timestamp,
                    wall_now,
                    None,
                    duplicate_flag,
                    gap_flag,
                    delayed_flag,
                    false,
                    pre_sync,
                ));
            }
            (MessageKind::TimeSync, Payload::TimeSync { base_time }) => {
                device.base_time = Some(*base_time);
                if device.status == DeviceStatus::Pending {
                    device.status = DeviceStatus::Active;
                }
                records.push(build_record(
                    RecordKind::Wire(MessageKind::TimeSync),
                    header,
                    wall_now,
                    wall_now,
                    None,
                    false,
                    false,
                    false,
                    false,
                    false,
                ));
            }
            (MessageKind::Shutdown, Payload::Shutdown) => {
                device.status = DeviceStatus::Down;
                records.push(build_record(
                    RecordKind::Wire(MessageKind::Shutdown),
                    header,
                    wall_now,
                    wall_now,
                    None,
                    duplicate_flag,
                    gap_flag,
                    delayed_flag,
                    false,
                    false,
                ));
            }
            (MessageKind::BatchedData, Payload::Batch { entries })
            | (MessageKind::BatchIncomplete, Payload::Batch { entries }) => {
                for entry in entries {
                    let (timestamp, entry_pre_sync) = resolve_timestamp(
                        device.base_time,
                        entry.sub_offset,
                        wall_now,
                        pre_sync,
                    );
                    let mut protocol_violation = false;
                    let value = match entry.value {
                        BatchEntryValue::Keyframe(v) => {
                            if updates_state {
                                device.last_value = Some(v);
                            }
                            device.last_value
                        }
                        BatchEntryValue::Delta(d) => {
                            if updates_state {
                                match device.last_value {
                                    Some(v) => device.last_value = Some(v.wrapping_add(d as i16)),
                                    None => protocol_violation = true,
                                }
                            }
                            device.last_value
                        }
                    };
                    records.push(build_record(
                        RecordKind::Wire(header.kind),
                        header,
                        timestamp,
                        wall_now,
                        value,
                        duplicate_flag,
                        gap_flag,
                        delayed_flag,
                        protocol_violation,
                        entry_pre_sync,
                    ));
                }
            }
            _ => {
                if header.kind.is_reserved() {
                    log::warn!(
                        "accepted reserved message kind {:?} from device {}",
                        header.kind,
                        header.device_id
                    );
                }
                records.push(build_record(
                    RecordKind::Wire(header.kind),
                    header,
                    wall_now,
                    wall_now,
                    None,
                    duplicate_flag,
                    gap_flag,
                    delayed_flag,
                    false,
                    pre_sync,
                ));
            }
        }

        drop(device);

        let cpu_time_ms = elapsed_ms(start);
        for mut record in records {
            record.cpu_time_ms = cpu_time_ms;
            self.emit(record);
        }

        Vec::new()
    }

    /// Sweep every ACTIVE device and transition any that have gone silent
    /// past their liveness ceiling into TIMEOUT, emitting a synthetic
    /// record (§4.4, §4.5).
    pub fn run_liveness_sweep(&self, now: Instant, wall_now: DateTime<Local>) {
        for device_id in self.devices.device_ids() {
            let Some(entry) = self.devices.lookup_by_id(device_id) else {
                continue;
            };
            let mut device = entry.lock();
            if device.status != DeviceStatus::Active {
                continue;
            }
            if device.is_silent_as_of(now) {
                device.status = DeviceStatus::Timeout;
                drop(device);
                let record = Record::new(
                    RecordKind::TimeoutSynthetic,
                    device_id,
                    0,
                    wall_now,
                    wall_now,
                    None,
                );
                self.emit(record);
            }
        }
    }

    fn emit(&self, record: Record) {
        if self.sink.try_emit(record).is_err() {
            log::warn!("log sink overflow, dropping record");
        }
    }
}

fn is_data_message(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Keyframe
            | MessageKind::DataDelta
            | MessageKind::Heartbeat
            | MessageKind::BatchedData
            | MessageKind::BatchIncomplete
            | MessageKind::DataDeltaQuantized
            | MessageKind::KeyframeQuantized
            | MessageKind::BatchedDataQuantized
    )
}

/// Resolve a device_timestamp from `base_time + offset`, falling back to
/// the collector's own arrival time when the device never announced a
/// base time (§4.4 PENDING-without-TIME_SYNC case).
fn resolve_timestamp(
    base_time: Option<u32>,
    offset: u16,
    fallback: DateTime<Local>,
    already_pre_sync: bool,
) -> (DateTime<Local>, bool) {
    match base_time {
        Some(base) => {
            let epoch_secs = base.wrapping_add(offset as u32) as i64;
            let timestamp = Local
                .timestamp_opt(epoch_secs, 0)
                .single()
                .unwrap_or(fallback);
            (timestamp, already_pre_sync)
        }
        None => (fallback, true),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    kind: RecordKind,
    header: &Header,
    device_timestamp: DateTime<Local>,
    arrival_time: DateTime<Local>,
    value: Option<i16>,
    duplicate_flag: bool,
    gap_flag: bool,
    delayed_flag: bool,
    protocol_violation: bool,
    pre_sync_flag: bool,
) -> Record {
    let mut record = Record::new(
        kind,
        header.device_id,
        header.sequence,
        device_timestamp,
        arrival_time,
        value,
    );
    record.duplicate_flag = duplicate_flag;
    record.gap_flag = gap_flag;
    record.delayed_flag = delayed_flag;
    record.protocol_violation = protocol_violation;
    record.pre_sync_flag = pre_sync_flag;
    record
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_datagram, BatchEntry};
    use crate::sink::JsonlSink;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    fn session() -> (ServerSession<JsonlSink>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("records.jsonl"));
        (ServerSession::new(sink), dir)
    }

    fn startup_bytes(mac: [u8; 6]) -> Vec<u8> {
        let payload = Payload::Startup {
            mac,
            batch_size: None,
        };
        let bytes = payload.encode();
        let header = Header::new(MessageKind::Startup, 0, 0, 0, bytes.len() as u8);
        encode_datagram(&header, &payload)
    }

    fn time_sync_bytes(device_id: u16, base_time: u32) -> Vec<u8> {
        let payload = Payload::TimeSync { base_time };
        let bytes = payload.encode();
        let header = Header::new(MessageKind::TimeSync, device_id, 0, 0, bytes.len() as u8);
        encode_datagram(&header, &payload)
    }

    fn keyframe_bytes(device_id: u16, sequence: u16, value: i16) -> Vec<u8> {
        let payload = Payload::Keyframe { value };
        let bytes = payload.encode();
        let header = Header::new(MessageKind::Keyframe, device_id, sequence, 0, bytes.len() as u8);
        encode_datagram(&header, &payload)
    }

    fn delta_bytes(device_id: u16, sequence: u16, delta: i8) -> Vec<u8> {
        let payload = Payload::DataDelta { delta };
        let bytes = payload.encode();
        let header = Header::new(MessageKind::DataDelta, device_id, sequence, 0, bytes.len() as u8);
        encode_datagram(&header, &payload)
    }

    fn register(session: &ServerSession<JsonlSink>, mac: [u8; 6]) -> u16 {
        let outgoing = session.process_datagram(&startup_bytes(mac), addr(), Local::now());
        let (ack_header, ack_payload) = protocol::decode_datagram(&outgoing[0].bytes).unwrap();
        assert_eq!(ack_header.kind, MessageKind::StartupAck);
        match ack_payload {
            Payload::StartupAck { device_id, .. } => device_id,
            _ => unreachable!(),
        }
    }

    #[test]
    fn startup_allocates_and_acks_a_device_id() {
        let (session, _dir) = session();
        let device_id = register(&session, [1, 2, 3, 4, 5, 6]);
        assert_ne!(device_id, 0);
        assert!(session.devices().contains(device_id));
    }

    #[test]
    fn s1_normal_delta_chain_reconstructs_values() {
        // S1 from the testable-properties scenarios.
        let (session, _dir) = session();
        let device_id = register(&session, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xfe]);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&keyframe_bytes(device_id, 1, 500), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 2, 5), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 3, -3), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 4, 2), addr(), Local::now());

        let entry = session.devices().lookup_by_id(device_id).unwrap();
        assert_eq!(entry.lock().last_value, Some(504));
    }

    #[test]
    fn s2_exact_replay_is_flagged_duplicate_and_does_not_alter_state() {
        let (session, _dir) = session();
        let device_id = register(&session, [1; 6]);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&keyframe_bytes(device_id, 1, 500), addr(), Local::now());
        let delta = delta_bytes(device_id, 2, 5);
        session.process_datagram(&delta, addr(), Local::now());
        session.process_datagram(&delta, addr(), Local::now());

        let entry = session.devices().lookup_by_id(device_id).unwrap();
        assert_eq!(entry.lock().last_value, Some(505));
    }

    #[test]
    fn s3_gap_then_delayed_fill_reconstructs_in_sequence_order() {
        let (session, _dir) = session();
        let device_id = register(&session, [2; 6]);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&keyframe_bytes(device_id, 10, 100), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 12, 2), addr(), Local::now());
        {
            let entry = session.devices().lookup_by_id(device_id).unwrap();
            assert_eq!(entry.lock().last_value, Some(102));
        }
        session.process_datagram(&delta_bytes(device_id, 11, 5), addr(), Local::now());
        let entry = session.devices().lookup_by_id(device_id).unwrap();
        assert_eq!(entry.lock().last_value, Some(107));
    }

    #[test]
    fn s4_rollover_across_u16_boundary_is_normal() {
        let (session, _dir) = session();
        let device_id = register(&session, [3; 6]);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&keyframe_bytes(device_id, 65534, 10), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 65535, 1), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 0, 1), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 1, 1), addr(), Local::now());

        let entry = session.devices().lookup_by_id(device_id).unwrap();
        let locked = entry.lock();
        assert_eq!(locked.last_value, Some(13));
        assert_eq!(locked.tracker.head(), Some(1));
    }

    #[test]
    fn s5_batch_of_five_entries_chains_through_last_value() {
        let (session, _dir) = session();
        let device_id = register(&session, [4; 6]);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&keyframe_bytes(device_id, 1, 100), addr(), Local::now());

        let entries = vec![
            BatchEntry {
                sub_offset: 0,
                value: BatchEntryValue::Delta(1),
            },
            BatchEntry {
                sub_offset: 1,
                value: BatchEntryValue::Delta(1),
            },
            BatchEntry {
                sub_offset: 2,
                value: BatchEntryValue::Delta(-2),
            },
            BatchEntry {
                sub_offset: 3,
                value: BatchEntryValue::Delta(3),
            },
            BatchEntry {
                sub_offset: 4,
                value: BatchEntryValue::Delta(-1),
            },
        ];
        let payload = Payload::Batch { entries };
        let bytes = payload.encode();
        let header = Header::new(MessageKind::BatchedData, device_id, 2, 0, bytes.len() as u8);
        let datagram = encode_datagram(&header, &payload);
        session.process_datagram(&datagram, addr(), Local::now());

        let entry = session.devices().lookup_by_id(device_id).unwrap();
        assert_eq!(entry.lock().last_value, Some(102));
    }

    #[test]
    fn s6_reconnection_emits_four_byte_startup_ack_and_preserves_sequence() {
        let (session, _dir) = session();
        let mac = [7; 6];
        let device_id = register(&session, mac);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&keyframe_bytes(device_id, 42, 1), addr(), Local::now());

        let outgoing = session.process_datagram(&startup_bytes(mac), addr(), Local::now());
        let (_, ack_payload) = protocol::decode_datagram(&outgoing[0].bytes).unwrap();
        match ack_payload {
            Payload::StartupAck {
                device_id: id,
                last_known_sequence,
            } => {
                assert_eq!(id, device_id);
                assert_eq!(last_known_sequence, Some(42));
            }
            _ => unreachable!(),
        }

        // Subsequent data continues from 43 with no false gap.
        session.process_datagram(&delta_bytes(device_id, 43, 1), addr(), Local::now());
        let entry = session.devices().lookup_by_id(device_id).unwrap();
        assert_eq!(entry.lock().tracker.head(), Some(43));
    }

    #[test]
    fn delta_before_keyframe_is_flagged_protocol_violation_without_crashing() {
        let (session, _dir) = session();
        let device_id = register(&session, [9; 6]);
        session.process_datagram(&time_sync_bytes(device_id, 1000), addr(), Local::now());
        session.process_datagram(&delta_bytes(device_id, 1, 5), addr(), Local::now());

        let entry = session.devices().lookup_by_id(device_id).unwrap();
        assert_eq!(entry.lock().last_value, None);
    }

    #[test]
    fn unknown_device_id_is_dropped_and_counted() {
        let (session, _dir) = session();
        session.process_datagram(&delta_bytes(999, 1, 5), addr(), Local::now());
        assert_eq!(session.dropped_unknown_device_count(), 1);
    }
}
