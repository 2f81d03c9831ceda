use crate::{
    crc16, FirmwareVersion, FrameKind, ProtocolError, Result, FRAME_HEADER_LEN, PING_RESPONSE_LEN,
    START_BYTE,
};

/// A decoded framing packet borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Frame type
    pub kind: FrameKind,
    /// Payload length as carried in the header
    pub length: u16,
    /// CRC16 over the first four header bytes and the payload
    pub crc: u16,
    /// Payload bytes
    pub payload: &'a [u8],
}

/// Build a framing packet.
///
/// Without a payload the frame is just the start byte and the frame kind.
pub fn encode_frame(kind: FrameKind, payload: Option<&[u8]>) -> Result<Vec<u8>> {
    let payload = match payload {
        Some(payload) => payload,
        None => return Ok(vec![START_BYTE, kind as u8]),
    };

    let len = u16::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
    let len_bytes = len.to_le_bytes();
    let header = [START_BYTE, kind as u8, len_bytes[0], len_bytes[1]];
    let crc = crc16(&[&header[..], payload]);

    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Parse a framing packet carrying a payload
pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame("Frame too short"));
    }
    if bytes[0] != START_BYTE {
        return Err(ProtocolError::MalformedFrame("Invalid start byte"));
    }

    let length = u16::from_le_bytes([bytes[2], bytes[3]]);
    let crc = u16::from_le_bytes([bytes[4], bytes[5]]);

    if FRAME_HEADER_LEN + length as usize != bytes.len() {
        return Err(ProtocolError::MalformedFrame("Length mismatch"));
    }

    let payload = &bytes[FRAME_HEADER_LEN..];
    if crc16(&[&bytes[..4], payload]) != crc {
        return Err(ProtocolError::MalformedFrame("CRC mismatch"));
    }

    // kind byte is CRC-protected
    let kind = FrameKind::try_from(bytes[1])
        .map_err(|_| ProtocolError::MalformedFrame("Unknown frame kind"))?;

    Ok(Frame {
        kind,
        length,
        crc,
        payload,
    })
}

/// Parse the fixed-size ping response.
///
/// Layout: start, kind, patch, minor, major, protocol name, options (LE u16),
/// crc (LE u16). The CRC covers the first eight bytes.
pub fn decode_ping_response(bytes: &[u8]) -> Result<(FirmwareVersion, u16)> {
    if bytes.len() != PING_RESPONSE_LEN {
        return Err(ProtocolError::MalformedFrame("Invalid ping response length"));
    }
    if bytes[0] != START_BYTE || bytes[1] != FrameKind::PingResponse as u8 {
        return Err(ProtocolError::MalformedFrame("Not a ping response"));
    }

    let crc = u16::from_le_bytes([bytes[8], bytes[9]]);
    if crc16(&[&bytes[..8]]) != crc {
        return Err(ProtocolError::MalformedFrame("CRC mismatch"));
    }

    let version = FirmwareVersion::new(bytes[4], bytes[3], bytes[2]);
    let options = u16::from_le_bytes([bytes[6], bytes[7]]);
    Ok((version, options))
}

/// Classify a two-byte bare frame (Ack, Nak, AckAbort, Ping)
pub fn decode_bare(bytes: &[u8]) -> Option<FrameKind> {
    match bytes {
        [START_BYTE, kind] => FrameKind::try_from(*kind).ok(),
        _ => None,
    }
}

/// True if the bytes are exactly an Ack frame
pub fn decode_ack(bytes: &[u8]) -> bool {
    decode_bare(bytes) == Some(FrameKind::Ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_frames() {
        assert_eq!(encode_frame(FrameKind::Ping, None).unwrap(), vec![0x5A, 0xA6]);
        assert_eq!(encode_frame(FrameKind::Ack, None).unwrap(), vec![0x5A, 0xA1]);
        assert_eq!(encode_frame(FrameKind::Nak, None).unwrap(), vec![0x5A, 0xA2]);
    }

    #[test]
    fn test_frame_serialization() {
        let payload = vec![0x0B, 0x00, 0x00, 0x00];
        let bytes = encode_frame(FrameKind::Command, Some(&payload[..])).unwrap();
        assert_eq!(bytes, vec![0x5A, 0xA4, 0x04, 0x00, 0x6F, 0x46, 0x0B, 0x00, 0x00, 0x00]);

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::Command);
        assert_eq!(frame.length, 4);
        assert_eq!(frame.crc, 0x466F);
        assert_eq!(frame.payload, &payload[..]);
    }

    #[test]
    fn test_kind_byte_flip_is_malformed() {
        let mut bytes = encode_frame(FrameKind::Command, Some(&[0x0Bu8, 0, 0, 0][..])).unwrap();
        bytes[1] ^= 0x80;
        assert_eq!(
            decode_frame(&bytes),
            Err(ProtocolError::MalformedFrame("CRC mismatch"))
        );
    }

    #[test]
    fn test_unknown_kind_with_valid_crc() {
        let header = [START_BYTE, 0x24, 0x00, 0x00];
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&crc16(&[&header[..]]).to_le_bytes());
        assert_eq!(
            decode_frame(&bytes),
            Err(ProtocolError::MalformedFrame("Unknown frame kind"))
        );
    }

    #[test]
    fn test_round_trip_all_kinds_and_lengths() {
        let kinds = [
            FrameKind::Ack,
            FrameKind::Nak,
            FrameKind::AckAbort,
            FrameKind::Command,
            FrameKind::Data,
            FrameKind::Ping,
            FrameKind::PingResponse,
        ];
        for kind in kinds {
            for len in [0usize, 1, 255, 256, 1024] {
                let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
                let bytes = encode_frame(kind, Some(&payload[..])).unwrap();
                assert_eq!(bytes.len(), FRAME_HEADER_LEN + len);

                let frame = decode_frame(&bytes).unwrap();
                assert_eq!(frame.kind, kind);
                assert_eq!(frame.length as usize, len);
                assert_eq!(frame.payload, &payload[..]);
            }
        }
    }

    #[test]
    fn test_oversized_payload() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            encode_frame(FrameKind::Data, Some(&payload[..])),
            Err(ProtocolError::PayloadTooLarge(u16::MAX as usize + 1))
        );
    }

    #[test]
    fn test_empty_payload_is_not_bare() {
        let bytes = encode_frame(FrameKind::Data, Some(&[0u8; 0][..])).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN);
        assert!(decode_frame(&bytes).unwrap().payload.is_empty());
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let payload: Vec<u8> = (0..24u8).map(|i| i.wrapping_mul(37)).collect();
        let bytes = encode_frame(FrameKind::Data, Some(&payload[..])).unwrap();

        for byte in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        decode_frame(&corrupted),
                        Err(ProtocolError::MalformedFrame(_))
                    ),
                    "flip of bit {} in byte {} went unnoticed",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let bytes = encode_frame(FrameKind::Command, Some(&[1u8, 2, 3, 4][..])).unwrap();

        let mut truncated = bytes.clone();
        truncated.pop();
        assert_eq!(
            decode_frame(&truncated),
            Err(ProtocolError::MalformedFrame("Length mismatch"))
        );

        let mut bad_start = bytes.clone();
        bad_start[0] = 0x00;
        assert_eq!(
            decode_frame(&bad_start),
            Err(ProtocolError::MalformedFrame("Invalid start byte"))
        );

        assert!(decode_frame(&[0x5A, 0xA4]).is_err());
        assert!(decode_frame(&[]).is_err());
    }

    #[test]
    fn test_ping_response() {
        let bytes = [0x5A, 0xA7, 0x00, 0x02, 0x01, 0x50, 0x00, 0x00, 0xAA, 0xEA];
        let (version, options) = decode_ping_response(&bytes).unwrap();
        assert_eq!(version, FirmwareVersion::new(1, 2, 0));
        assert_eq!(options, 0);

        let mut corrupted = bytes;
        corrupted[4] = 0x02;
        assert!(decode_ping_response(&corrupted).is_err());
        assert!(decode_ping_response(&bytes[..9]).is_err());

        let mut wrong_kind = bytes;
        wrong_kind[1] = 0xA1;
        assert!(decode_ping_response(&wrong_kind).is_err());
    }

    #[test]
    fn test_ping_response_options() {
        let mut bytes = vec![0x5A, 0xA7, 0x03, 0x00, 0x02, 0x50, 0x34, 0x12];
        let crc = crc16(&[&bytes[..]]);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let (version, options) = decode_ping_response(&bytes).unwrap();
        assert_eq!(version, FirmwareVersion::new(2, 0, 3));
        assert_eq!(options, 0x1234);
    }

    #[test]
    fn test_ack() {
        assert!(decode_ack(&[0x5A, 0xA1]));
        assert!(!decode_ack(&[0x5A, 0xA2]));
        assert!(!decode_ack(&[0x5A]));
        assert!(!decode_ack(&[0x5A, 0xA1, 0x00]));
        assert_eq!(decode_bare(&[0x5A, 0xA2]), Some(FrameKind::Nak));
        assert_eq!(decode_bare(&[0x00, 0xA1]), None);
    }
}
