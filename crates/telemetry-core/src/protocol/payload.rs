// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed payload variants and their byte layouts (§3).

use super::error::DecodeError;
use super::header::MessageKind;

/// A single entry inside a `BATCHED_DATA`/`BATCH_INCOMPLETE` payload (§3, I3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub sub_offset: u16,
    pub value: BatchEntryValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEntryValue {
    Keyframe(i16),
    Delta(i8),
}

impl BatchEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sub_offset.to_be_bytes());
        match self.value {
            BatchEntryValue::Keyframe(v) => {
                buf.push(MessageKind::Keyframe.to_code());
                buf.extend_from_slice(&v.to_be_bytes());
            }
            BatchEntryValue::Delta(d) => {
                buf.push(MessageKind::DataDelta.to_code());
                buf.push(d as u8);
            }
        }
    }
}

/// A decoded, type-checked payload (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Startup {
        mac: [u8; 6],
        batch_size: Option<u8>,
    },
    StartupAck {
        device_id: u16,
        last_known_sequence: Option<u16>,
    },
    TimeSync {
        base_time: u32,
    },
    Keyframe {
        value: i16,
    },
    DataDelta {
        delta: i8,
    },
    Heartbeat,
    Shutdown,
    /// Covers both `BATCHED_DATA` and `BATCH_INCOMPLETE`; the caller
    /// distinguishes the two via the header's `MessageKind`.
    Batch {
        entries: Vec<BatchEntry>,
    },
    /// A reserved `*_QUANTIZED` kind (§9): accepted and logged, semantics
    /// deliberately unspecified.
    Reserved {
        raw: Vec<u8>,
    },
}

impl Payload {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Startup { mac, batch_size } => {
                let mut buf = Vec::with_capacity(7);
                buf.extend_from_slice(mac);
                if let Some(b) = batch_size {
                    buf.push(*b);
                }
                buf
            }
            Payload::StartupAck {
                device_id,
                last_known_sequence,
            } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&device_id.to_be_bytes());
                if let Some(seq) = last_known_sequence {
                    buf.extend_from_slice(&seq.to_be_bytes());
                }
                buf
            }
            Payload::TimeSync { base_time } => base_time.to_be_bytes().to_vec(),
            Payload::Keyframe { value } => value.to_be_bytes().to_vec(),
            Payload::DataDelta { delta } => vec![*delta as u8],
            Payload::Heartbeat | Payload::Shutdown => Vec::new(),
            Payload::Batch { entries } => {
                let mut buf = Vec::with_capacity(entries.len() * 4);
                for entry in entries {
                    entry.encode(&mut buf);
                }
                buf
            }
            Payload::Reserved { raw } => raw.clone(),
        }
    }

    pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<Self, DecodeError> {
        match kind {
            MessageKind::Startup => match bytes.len() {
                6 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(bytes);
                    Ok(Payload::Startup {
                        mac,
                        batch_size: None,
                    })
                }
                7 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&bytes[..6]);
                    Ok(Payload::Startup {
                        mac,
                        batch_size: Some(bytes[6]),
                    })
                }
                _ => Err(DecodeError::MalformedPayload {
                    reason: format!("STARTUP payload must be 6 or 7 bytes, got {}", bytes.len()),
                }),
            },
            MessageKind::StartupAck => match bytes.len() {
                2 => Ok(Payload::StartupAck {
                    device_id: u16::from_be_bytes([bytes[0], bytes[1]]),
                    last_known_sequence: None,
                }),
                4 => Ok(Payload::StartupAck {
                    device_id: u16::from_be_bytes([bytes[0], bytes[1]]),
                    last_known_sequence: Some(u16::from_be_bytes([bytes[2], bytes[3]])),
                }),
                _ => Err(DecodeError::MalformedPayload {
                    reason: format!(
                        "STARTUP_ACK payload must be 2 or 4 bytes, got {}",
                        bytes.len()
                    ),
                }),
            },
            MessageKind::TimeSync => {
                if bytes.len() != 4 {
                    return Err(DecodeError::MalformedPayload {
                        reason: format!("TIME_SYNC payload must be 4 bytes, got {}", bytes.len()),
                    });
                }
                Ok(Payload::TimeSync {
                    base_time: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                })
            }
            MessageKind::Keyframe => {
                if bytes.len() != 2 {
                    return Err(DecodeError::MalformedPayload {
                        reason: format!("KEYFRAME payload must be 2 bytes, got {}", bytes.len()),
                    });
                }
                Ok(Payload::Keyframe {
                    value: i16::from_be_bytes([bytes[0], bytes[1]]),
                })
            }
            MessageKind::DataDelta => {
                if bytes.len() != 1 {
                    return Err(DecodeError::MalformedPayload {
                        reason: format!("DATA_DELTA payload must be 1 byte, got {}", bytes.len()),
                    });
                }
                Ok(Payload::DataDelta {
                    delta: bytes[0] as i8,
                })
            }
            MessageKind::Heartbeat | MessageKind::Shutdown => {
                if !bytes.is_empty() {
                    return Err(DecodeError::MalformedPayload {
                        reason: "HEARTBEAT/SHUTDOWN payload must be empty".into(),
                    });
                }
                Ok(if kind == MessageKind::Heartbeat {
                    Payload::Heartbeat
                } else {
                    Payload::Shutdown
                })
            }
            MessageKind::BatchedData | MessageKind::BatchIncomplete => {
                decode_batch(bytes).map(|entries| Payload::Batch { entries })
            }
            MessageKind::DataDeltaQuantized
            | MessageKind::KeyframeQuantized
            | MessageKind::BatchedDataQuantized => Ok(Payload::Reserved {
                raw: bytes.to_vec(),
            }),
        }
    }
}

fn decode_batch(bytes: &[u8]) -> Result<Vec<BatchEntry>, DecodeError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        // sub_offset (2 bytes) + entry type (1 byte) is the minimum header.
        if remaining < 3 {
            return Err(DecodeError::BatchEntryMalformed {
                reason: format!("trailing {} byte(s) too short for an entry header", remaining),
            });
        }
        let sub_offset = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let entry_type = bytes[offset + 2];
        offset += 3;

        let entry_kind = MessageKind::from_code(entry_type).ok_or(DecodeError::BatchEntryMalformed {
            reason: format!("unknown batch entry type code {:#x}", entry_type),
        })?;

        let value = match entry_kind {
            MessageKind::Keyframe => {
                if bytes.len() - offset < 2 {
                    return Err(DecodeError::BatchEntryMalformed {
                        reason: "trailing partial keyframe entry".into(),
                    });
                }
                let v = i16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
                offset += 2;
                BatchEntryValue::Keyframe(v)
            }
            MessageKind::DataDelta => {
                if bytes.len() - offset < 1 {
                    return Err(DecodeError::BatchEntryMalformed {
                        reason: "trailing partial delta entry".into(),
                    });
                }
                let d = bytes[offset] as i8;
                offset += 1;
                BatchEntryValue::Delta(d)
            }
            _ => {
                return Err(DecodeError::BatchEntryMalformed {
                    reason: format!("entry type {:?} is not valid inside a batch", entry_kind),
                })
            }
        };

        entries.push(BatchEntry { sub_offset, value });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_without_batch_size_roundtrips() {
        let p = Payload::Startup {
            mac: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xfe],
            batch_size: None,
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), 6);
        assert_eq!(Payload::decode(MessageKind::Startup, &bytes).unwrap(), p);
    }

    #[test]
    fn startup_with_batch_size_roundtrips() {
        let p = Payload::Startup {
            mac: [1, 2, 3, 4, 5, 6],
            batch_size: Some(5),
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), 7);
        assert_eq!(Payload::decode(MessageKind::Startup, &bytes).unwrap(), p);
    }

    #[test]
    fn startup_ack_two_and_four_byte_forms() {
        let short = Payload::StartupAck {
            device_id: 7,
            last_known_sequence: None,
        };
        assert_eq!(
            Payload::decode(MessageKind::StartupAck, &short.encode()).unwrap(),
            short
        );

        let long = Payload::StartupAck {
            device_id: 7,
            last_known_sequence: Some(42),
        };
        let bytes = long.encode();
        assert_eq!(bytes.len(), 4);
        assert_eq!(
            Payload::decode(MessageKind::StartupAck, &bytes).unwrap(),
            long
        );
    }

    #[test]
    fn delta_boundary_values_encodable() {
        // B1: +/-127 encodable as DATA_DELTA.
        for v in [127i8, -128i8, -127i8] {
            let p = Payload::DataDelta { delta: v };
            let bytes = p.encode();
            assert_eq!(Payload::decode(MessageKind::DataDelta, &bytes).unwrap(), p);
        }
    }

    #[test]
    fn keyframe_full_range_roundtrips() {
        for v in [i16::MIN, -1, 0, 1, i16::MAX] {
            let p = Payload::Keyframe { value: v };
            let bytes = p.encode();
            assert_eq!(Payload::decode(MessageKind::Keyframe, &bytes).unwrap(), p);
        }
    }

    #[test]
    fn heartbeat_and_shutdown_reject_nonempty_payload() {
        assert!(Payload::decode(MessageKind::Heartbeat, &[0]).is_err());
        assert!(Payload::decode(MessageKind::Shutdown, &[0]).is_err());
        assert_eq!(
            Payload::decode(MessageKind::Heartbeat, &[]).unwrap(),
            Payload::Heartbeat
        );
    }

    #[test]
    fn batch_of_entries_fills_payload_exactly() {
        // B2: exact fill is valid.
        let entries = vec![
            BatchEntry {
                sub_offset: 0,
                value: BatchEntryValue::Delta(1),
            },
            BatchEntry {
                sub_offset: 1,
                value: BatchEntryValue::Keyframe(100),
            },
        ];
        let payload = Payload::Batch {
            entries: entries.clone(),
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 3 + 1 + 3 + 2);
        let decoded = Payload::decode(MessageKind::BatchedData, &bytes).unwrap();
        assert_eq!(decoded, Payload::Batch { entries });
    }

    #[test]
    fn trailing_partial_batch_entry_is_malformed() {
        // B2: a trailing partial entry must error.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.push(MessageKind::DataDelta.to_code());
        bytes.push(5); // complete delta entry
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(MessageKind::Keyframe.to_code());
        // missing the 2-byte keyframe value -> trailing partial entry

        let err = Payload::decode(MessageKind::BatchedData, &bytes).unwrap_err();
        assert!(matches!(err, DecodeError::BatchEntryMalformed { .. }));
    }

    #[test]
    fn unknown_entry_type_is_malformed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.push(0xff); // not a valid MessageKind code at all
        bytes.push(0);
        let err = Payload::decode(MessageKind::BatchedData, &bytes).unwrap_err();
        assert!(matches!(err, DecodeError::BatchEntryMalformed { .. }));
    }

    #[test]
    fn reserved_kinds_round_trip_raw_bytes() {
        let raw = vec![1, 2, 3, 4];
        let decoded = Payload::decode(MessageKind::KeyframeQuantized, &raw).unwrap();
        assert_eq!(decoded, Payload::Reserved { raw: raw.clone() });
        assert_eq!(decoded.encode(), raw);
    }
}
