// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmit state machine driven by a probe client (§4.6, §4.7).

use crate::protocol::{encode_datagram, BatchEntry, BatchEntryValue, DecodeError, Header, MessageKind, Payload};

/// Every 10th data-carrying packet is forced to a KEYFRAME (§4.7 rule 1).
const KEYFRAME_EVERY_N_PACKETS: u64 = 10;
/// A delta magnitude beyond this can never fit in a signed byte and must
/// be sent as a KEYFRAME instead (§4.7 rule 2, §8 B1).
const MAX_ENCODABLE_DELTA: i32 = 127;
/// A TIME_SYNC is re-sent (and the offset reference reset) after this many
/// data-carrying packets (§4.7).
const TIME_SYNC_EVERY_N_PACKETS: u64 = 100;

/// One outgoing datagram the caller's socket should send, with the kind
/// attached so the caller can pace/log appropriately.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
}

/// What the selection rule decided to send for one sampler tick (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Keyframe(i16),
    Delta(i8),
    Heartbeat,
}

fn select(packet_counter: u64, sample: i16, delta: i32, delta_threshold: i32) -> Selection {
    if packet_counter % KEYFRAME_EVERY_N_PACKETS == 0 {
        Selection::Keyframe(sample)
    } else if delta.abs() > MAX_ENCODABLE_DELTA {
        Selection::Keyframe(sample)
    } else if delta.abs() > delta_threshold {
        Selection::Delta(delta as i8)
    } else {
        Selection::Heartbeat
    }
}

/// Transmit-side state machine for one simulated device (§4.7).
pub struct ClientSession {
    mac: [u8; 6],
    batch_size: u8,
    delta_threshold: i32,
    device_id: u16,
    sequence: u16,
    base_time: u32,
    last_sent_value: i16,
    packet_counter: u64,
    data_packet_counter: u64,
    batch_buffer: Vec<BatchEntry>,
}

impl ClientSession {
    pub fn new(mac: [u8; 6], batch_size: u8, delta_threshold: u32) -> Self {
        Self {
            mac,
            batch_size,
            delta_threshold: delta_threshold as i32,
            device_id: 0,
            sequence: 1,
            base_time: 0,
            last_sent_value: 0,
            packet_counter: 0,
            data_packet_counter: 0,
            batch_buffer: Vec::new(),
        }
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// Whether batching is active: `batch_size > 1` (§4.7).
    fn batching_enabled(&self) -> bool {
        self.batch_size > 1
    }

    /// Build the STARTUP datagram (§4.7 step 1).
    pub fn build_startup(&self) -> Vec<u8> {
        let payload = Payload::Startup {
            mac: self.mac,
            batch_size: Some(self.batch_size),
        };
        let header = Header::new(MessageKind::Startup, 0, 0, 0, payload.encode().len() as u8);
        encode_datagram(&header, &payload)
    }

    /// Parse a STARTUP_ACK reply and adopt the assigned device_id
    /// (§4.7 step 1).
    pub fn accept_startup_ack(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let (header, payload) = crate::protocol::decode_datagram(bytes)?;
        if header.kind != MessageKind::StartupAck {
            return Err(DecodeError::UnknownType {
                code: header.kind.to_code(),
            });
        }
        if let Payload::StartupAck { device_id, .. } = payload {
            self.device_id = device_id;
        }
        Ok(())
    }

    /// Build TIME_SYNC with `epoch_now` as the new base time, resetting
    /// the offset reference (§4.7 step 2).
    pub fn build_time_sync(&mut self, epoch_now: u32) -> Vec<u8> {
        self.base_time = epoch_now;
        let payload = Payload::TimeSync {
            base_time: epoch_now,
        };
        let header = Header::new(
            MessageKind::TimeSync,
            self.device_id,
            0,
            0,
            payload.encode().len() as u8,
        );
        encode_datagram(&header, &payload)
    }

    fn time_offset(&self, epoch_now: u32) -> u16 {
        (epoch_now.wrapping_sub(self.base_time) & 0xffff) as u16
    }

    /// Consume the current sequence counter for `kind`, applying the
    /// heartbeat increment rule (§4.7, §9 open question): heartbeats
    /// increment the sequence only when batching is disabled.
    fn consume_sequence(&mut self, kind: MessageKind) -> u16 {
        let seq = self.sequence;
        let increments = kind != MessageKind::Heartbeat || !self.batching_enabled();
        if increments {
            self.sequence = self.sequence.wrapping_add(1);
        }
        seq
    }

    /// Build the very first KEYFRAME at sequence 1 (§4.7 step 3).
    pub fn build_initial_keyframe(&mut self, value: i16, epoch_now: u32) -> Vec<u8> {
        self.last_sent_value = value;
        self.packet_counter += 1;
        self.data_packet_counter += 1;
        let sequence = self.consume_sequence(MessageKind::Keyframe);
        self.encode_single(MessageKind::Keyframe, Payload::Keyframe { value }, sequence, epoch_now)
    }

    /// Run one sampler tick: select KEYFRAME/DATA_DELTA/HEARTBEAT, batch
    /// or send immediately, and inject a periodic TIME_SYNC (§4.7).
    pub fn tick(&mut self, sample: i16, epoch_now: u32) -> Vec<Outbound> {
        self.packet_counter += 1;
        let delta = sample as i32 - self.last_sent_value as i32;
        let selection = select(self.packet_counter, sample, delta, self.delta_threshold);

        let mut outbound = Vec::new();

        if !matches!(selection, Selection::Heartbeat) {
            self.data_packet_counter += 1;
            if self.data_packet_counter % TIME_SYNC_EVERY_N_PACKETS == 0 {
                let bytes = self.build_time_sync(epoch_now);
                outbound.push(Outbound {
                    kind: MessageKind::TimeSync,
                    bytes,
                });
            }
        }

        match selection {
            Selection::Keyframe(value) => {
                self.last_sent_value = value;
                if self.batching_enabled() {
                    self.push_batch_entry(BatchEntryValue::Keyframe(value), epoch_now, &mut outbound);
                } else {
                    let sequence = self.consume_sequence(MessageKind::Keyframe);
                    let bytes = self.encode_single(
                        MessageKind::Keyframe,
                        Payload::Keyframe { value },
                        sequence,
                        epoch_now,
                    );
                    outbound.push(Outbound {
                        kind: MessageKind::Keyframe,
                        bytes,
                    });
                }
            }
            Selection::Delta(delta) => {
                self.last_sent_value = self.last_sent_value.wrapping_add(delta as i16);
                if self.batching_enabled() {
                    self.push_batch_entry(BatchEntryValue::Delta(delta), epoch_now, &mut outbound);
                } else {
                    let sequence = self.consume_sequence(MessageKind::DataDelta);
                    let bytes = self.encode_single(
                        MessageKind::DataDelta,
                        Payload::DataDelta { delta },
                        sequence,
                        epoch_now,
                    );
                    outbound.push(Outbound {
                        kind: MessageKind::DataDelta,
                        bytes,
                    });
                }
            }
            Selection::Heartbeat => {
                let sequence = self.consume_sequence(MessageKind::Heartbeat);
                let bytes =
                    self.encode_single(MessageKind::Heartbeat, Payload::Heartbeat, sequence, epoch_now);
                outbound.push(Outbound {
                    kind: MessageKind::Heartbeat,
                    bytes,
                });
            }
        }

        outbound
    }

    fn push_batch_entry(&mut self, value: BatchEntryValue, epoch_now: u32, outbound: &mut Vec<Outbound>) {
        let sub_offset = self.time_offset(epoch_now);
        self.batch_buffer.push(BatchEntry { sub_offset, value });
        if self.batch_buffer.len() >= self.batch_size as usize {
            outbound.push(self.flush_batch(MessageKind::BatchedData, epoch_now));
        }
    }

    fn flush_batch(&mut self, kind: MessageKind, epoch_now: u32) -> Outbound {
        let entries = std::mem::take(&mut self.batch_buffer);
        let payload = Payload::Batch { entries };
        let sequence = self.consume_sequence(kind);
        let bytes = self.encode_single(kind, payload, sequence, epoch_now);
        Outbound { kind, bytes }
    }

    fn encode_single(&self, kind: MessageKind, payload: Payload, sequence: u16, epoch_now: u32) -> Vec<u8> {
        let time_offset = self.time_offset(epoch_now);
        let body = payload.encode();
        let header = Header::new(kind, self.device_id, sequence, time_offset, body.len() as u8);
        encode_datagram(&header, &payload)
    }

    /// Flush any partial batch as BATCH_INCOMPLETE, then send SHUTDOWN
    /// (§4.7 shutdown, batching).
    pub fn shutdown(&mut self, epoch_now: u32) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        if !self.batch_buffer.is_empty() {
            outbound.push(self.flush_batch(MessageKind::BatchIncomplete, epoch_now));
        }
        let sequence = self.consume_sequence(MessageKind::Shutdown);
        let bytes = self.encode_single(MessageKind::Shutdown, Payload::Shutdown, sequence, epoch_now);
        outbound.push(Outbound {
            kind: MessageKind::Shutdown,
            bytes,
        });
        outbound
    }
}
