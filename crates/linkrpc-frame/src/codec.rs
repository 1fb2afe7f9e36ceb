use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::reassembler::ReassemblerConfig;

/// Start-of-frame marker.
pub const START_FLAG: u8 = 0xAA;

/// End-of-frame marker.
pub const END_FLAG: u8 = 0x55;

/// Frame header: start (1) + command (1) + frame id (2) + length (2) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Frame trailer: checksum (1) + end (1) = 2 bytes.
pub const TRAILER_SIZE: usize = 2;

/// Smallest well-formed frame (empty payload).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TRAILER_SIZE;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Frame command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameCommand {
    Request = 0,
    Response = 1,
    /// Receiver could not decode a frame and asks for it again.
    Retry = 2,
    /// Reserved.
    Busy = 3,
    /// Reserved.
    Free = 4,
}

impl FrameCommand {
    pub fn name(self) -> &'static str {
        match self {
            FrameCommand::Request => "REQUEST",
            FrameCommand::Response => "RESPONSE",
            FrameCommand::Retry => "RETRY",
            FrameCommand::Busy => "BUSY",
            FrameCommand::Free => "FREE",
        }
    }
}

impl TryFrom<u8> for FrameCommand {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameCommand::Request),
            1 => Ok(FrameCommand::Response),
            2 => Ok(FrameCommand::Retry),
            3 => Ok(FrameCommand::Busy),
            4 => Ok(FrameCommand::Free),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

impl From<FrameCommand> for u8 {
    fn from(command: FrameCommand) -> Self {
        command as u8
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    /// Sender-assigned id, wraps to zero on overflow.
    pub frame_id: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(command: FrameCommand, frame_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            frame_id,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload + trailer).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }

    /// Encode this frame into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self.command, self.frame_id, &self.payload, &mut dst)?;
        Ok(dst.freeze())
    }
}

/// XOR of every byte in `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌──────┬─────┬───────────┬──────────┬─────────┬──────────┬──────┐
/// │ 0xAA │ cmd │ frame id  │ length   │ payload │ checksum │ 0x55 │
/// │      │ 1B  │ (2B LE)   │ (2B LE)  │         │ XOR      │      │
/// └──────┴─────┴───────────┴──────────┴─────────┴──────────┴──────┘
/// ```
///
/// The checksum covers `cmd` through the last payload byte.
pub fn encode_frame(
    command: FrameCommand,
    frame_id: u16,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    dst.reserve(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    let begin = dst.len();
    dst.put_u8(START_FLAG);
    dst.put_u8(command.into());
    dst.put_u16_le(frame_id);
    dst.put_u16_le(payload.len() as u16);
    dst.put_slice(payload);
    let sum = checksum(&dst[begin + 1..]);
    dst.put_u8(sum);
    dst.put_u8(END_FLAG);
    Ok(())
}

/// Decode a frame from a carved span.
///
/// The span is trimmed to the first start marker and the last end marker;
/// what remains must be exactly one frame with a matching checksum.
pub fn decode_frame(raw: &[u8]) -> Result<Frame> {
    let start = raw
        .iter()
        .position(|b| *b == START_FLAG)
        .ok_or(FrameError::MissingMarker)?;
    let end = raw
        .iter()
        .rposition(|b| *b == END_FLAG)
        .filter(|end| *end > start)
        .ok_or(FrameError::MissingMarker)?;
    let span = &raw[start..=end];

    if span.len() < MIN_FRAME_SIZE {
        return Err(FrameError::TooShort {
            len: span.len(),
            min: MIN_FRAME_SIZE,
        });
    }

    let declared = u16::from_le_bytes([span[4], span[5]]) as usize;
    if span.len() != HEADER_SIZE + declared + TRAILER_SIZE {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: span.len(),
        });
    }

    let sum_at = span.len() - TRAILER_SIZE;
    let expected = checksum(&span[1..sum_at]);
    if expected != span[sum_at] {
        return Err(FrameError::ChecksumMismatch {
            expected,
            actual: span[sum_at],
        });
    }

    let command = FrameCommand::try_from(span[1])?;
    let frame_id = u16::from_le_bytes([span[2], span[3]]);
    let payload = Bytes::copy_from_slice(&span[HEADER_SIZE..sum_at]);

    Ok(Frame {
        command,
        frame_id,
        payload,
    })
}

/// Best-effort frame id of a span that may not decode.
pub fn peek_frame_id(raw: &[u8]) -> Option<u16> {
    let start = raw.iter().position(|b| *b == START_FLAG)?;
    let id = raw.get(start + 2..start + 4)?;
    Some(u16::from_le_bytes([id[0], id[1]]))
}

/// Configuration for framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size accepted for sending. Default: 65535 bytes.
    pub max_payload_size: usize,
    /// Receive-side buffering.
    pub reassembler: ReassemblerConfig,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD,
            reassembler: ReassemblerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(command: FrameCommand, frame_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(command, frame_id, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_encode_layout() {
        let wire = encoded(FrameCommand::Request, 0x0102, &[0x10, 0x20]);
        assert_eq!(
            wire,
            vec![
                0xAA,
                0x00,
                0x02,
                0x01,
                0x02,
                0x00,
                0x10,
                0x20,
                0x00 ^ 0x02 ^ 0x01 ^ 0x02 ^ 0x00 ^ 0x10 ^ 0x20,
                0x55
            ]
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let wire = encoded(FrameCommand::Response, 7, b"hello, link");
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.command, FrameCommand::Response);
        assert_eq!(frame.frame_id, 7);
        assert_eq!(frame.payload.as_ref(), b"hello, link");
        assert_eq!(frame.wire_size(), wire.len());
    }

    #[test]
    fn test_empty_payload() {
        let wire = encoded(FrameCommand::Retry, 9, b"");
        assert_eq!(wire.len(), MIN_FRAME_SIZE);
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.command, FrameCommand::Retry);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_payload_containing_markers() {
        let payload = [START_FLAG, END_FLAG, END_FLAG, START_FLAG];
        let wire = encoded(FrameCommand::Request, 1, &payload);
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.payload.as_ref(), &payload);
    }

    #[test]
    fn test_leading_and_trailing_noise_is_trimmed() {
        let mut wire = vec![0x00, 0x13];
        wire.extend(encoded(FrameCommand::Request, 3, b"abc"));
        wire.push(0x42);
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.payload.as_ref(), b"abc");
    }

    #[test]
    fn test_missing_markers() {
        assert!(matches!(
            decode_frame(&[0x01, 0x02, 0x55]),
            Err(FrameError::MissingMarker)
        ));
        assert!(matches!(
            decode_frame(&[0xAA, 0x01, 0x02]),
            Err(FrameError::MissingMarker)
        ));
        assert!(matches!(
            decode_frame(&[0x55, 0xAA]),
            Err(FrameError::MissingMarker)
        ));
    }

    #[test]
    fn test_too_short() {
        let err = decode_frame(&[0xAA, 0x00, 0x00, 0x55]).unwrap_err();
        assert!(matches!(err, FrameError::TooShort { len: 4, .. }));
    }

    #[test]
    fn test_length_mismatch() {
        let mut wire = encoded(FrameCommand::Request, 1, b"abcd");
        wire[4] = 5;
        let err = decode_frame(&wire).unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { declared: 5, .. }));
    }

    #[test]
    fn test_unknown_command() {
        let mut wire = encoded(FrameCommand::Request, 1, b"x");
        wire[1] = 0x09;
        let sum_at = wire.len() - 2;
        wire[sum_at] = checksum(&wire[1..sum_at]);
        assert!(matches!(
            decode_frame(&wire),
            Err(FrameError::UnknownCommand(0x09))
        ));
    }

    #[test]
    fn test_single_bit_flip_is_always_detected() {
        let wire = encoded(FrameCommand::Request, 0x1234, &[0x01, 0x11, 0x21, 0x31, 0x41]);
        // Everything between the start marker and the end marker.
        for index in 1..wire.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = wire.clone();
                corrupted[index] ^= 1 << bit;
                assert!(
                    decode_frame(&corrupted).is_err(),
                    "flip of bit {bit} at byte {index} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let mut buf = BytesMut::new();
        let err = encode_frame(FrameCommand::Request, 0, &payload, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_peek_frame_id() {
        let wire = encoded(FrameCommand::Request, 0xBEEF, b"zz");
        assert_eq!(peek_frame_id(&wire), Some(0xBEEF));
        assert_eq!(peek_frame_id(&[0xAA, 0x00]), None);
        assert_eq!(peek_frame_id(&[0x00]), None);
    }

    #[test]
    fn test_command_byte_conversions() {
        for byte in 0u8..=4 {
            let command = FrameCommand::try_from(byte).unwrap();
            assert_eq!(u8::from(command), byte);
        }
        assert_eq!(FrameCommand::Busy.name(), "BUSY");
    }
}
