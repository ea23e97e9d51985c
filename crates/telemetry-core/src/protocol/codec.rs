// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Whole-datagram encode/decode: header + payload as one unit (§4.1).

use super::error::DecodeError;
use super::header::{Header, HEADER_LEN, PROTOCOL_VERSION};
use super::payload::Payload;

/// Serialize a header and its matching payload into one UDP datagram.
///
/// The caller is responsible for keeping `header.payload_length` in sync
/// with `payload`; this is enforced by construction in `Header::new` call
/// sites rather than re-derived here, mirroring the teacher's codecs where
/// length fields are set once at the point of encoding.
pub fn encode_datagram(header: &Header, payload: &Payload) -> Vec<u8> {
    let body = payload.encode();
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    let mut head_bytes = [0u8; HEADER_LEN];
    header.write_to(&mut head_bytes);
    buf.extend_from_slice(&head_bytes);
    buf.extend_from_slice(&body);
    buf
}

/// Parse a raw datagram into a header and a type-checked payload.
///
/// Rejects anything shorter than the header, any version other than
/// [`PROTOCOL_VERSION`], unknown type codes, and any payload whose declared
/// length disagrees with what actually followed the header (§7).
pub fn decode_datagram(bytes: &[u8]) -> Result<(Header, Payload), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Short);
    }

    let version = bytes[0] >> 4;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::VersionMismatch { found: version });
    }

    let code = bytes[0] & 0x0f;
    let kind = super::header::MessageKind::from_code(code)
        .ok_or(DecodeError::UnknownType { code })?;

    let device_id = u16::from_be_bytes([bytes[1], bytes[2]]);
    let sequence = u16::from_be_bytes([bytes[3], bytes[4]]);
    let time_offset = u16::from_be_bytes([bytes[5], bytes[6]]);
    let payload_length = bytes[7];

    let body = &bytes[HEADER_LEN..];
    if body.len() != payload_length as usize {
        return Err(DecodeError::PayloadLengthMismatch {
            declared: payload_length,
            actual: body.len(),
        });
    }

    let payload = Payload::decode(kind, body)?;

    let header = Header {
        version,
        kind,
        device_id,
        sequence,
        time_offset,
        payload_length,
    };

    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::header::MessageKind;

    #[test]
    fn roundtrips_a_keyframe_datagram() {
        let header = Header::new(MessageKind::Keyframe, 3, 10, 500, 2);
        let payload = Payload::Keyframe { value: -42 };
        let bytes = encode_datagram(&header, &payload);
        assert_eq!(bytes.len(), HEADER_LEN + 2);

        let (decoded_header, decoded_payload) = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn rejects_short_datagrams() {
        assert!(matches!(decode_datagram(&[0u8; 3]), Err(DecodeError::Short)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = 2 << 4; // version 2, kind STARTUP
        let err = decode_datagram(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::VersionMismatch { found: 2 }));
    }

    #[test]
    fn rejects_unknown_type_code() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = (PROTOCOL_VERSION << 4) | 0x0f; // code 15, never assigned
        let err = decode_datagram(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType { code: 15 }));
    }

    #[test]
    fn rejects_payload_length_mismatch() {
        let header = Header::new(MessageKind::DataDelta, 1, 1, 0, 1);
        let mut bytes = encode_datagram(&header, &Payload::DataDelta { delta: 5 });
        bytes.push(0xff); // trailing byte not accounted for in payload_length
        let err = decode_datagram(&bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadLengthMismatch {
                declared: 1,
                actual: 2
            }
        ));
    }
}
