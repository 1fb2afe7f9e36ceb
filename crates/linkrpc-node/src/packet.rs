use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::PacketError;
use crate::function::FunctionId;
use crate::request::RequestSn;

pub use linkrpc_frame::FrameCommand as Command;

/// Start-of-packet marker.
pub const PACKET_START: u8 = 0xAA;

/// End-of-packet marker.
pub const PACKET_END: u8 = 0x55;

/// Fixed header: start (1) + command (1) + sequence (2) + data length (2).
pub const PACKET_HEADER_SIZE: usize = 6;

/// Smallest packet: fixed header plus end marker.
pub const MIN_PACKET_SIZE: usize = PACKET_HEADER_SIZE + 1;

/// Function id (4) + request number (4) leading every request/response body.
pub const CALL_FIELDS_SIZE: usize = 8;

const MAX_DATA_LENGTH: usize = i16::MAX as usize;

/// An RPC message.
///
/// Request and response packets carry a function id, the caller's request
/// number, and a payload: parameters for a request, the result for a
/// response. Other commands carry no body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub sequence: i16,
    /// Byte count of the optional fields, as last encoded or decoded.
    pub data_length: i16,
    pub function_id: FunctionId,
    pub request_sn: RequestSn,
    pub function_parameter: Bytes,
    pub function_result: Bytes,
    valid: bool,
}

impl Packet {
    /// Build a request packet.
    pub fn request(
        sequence: i16,
        function_id: FunctionId,
        request_sn: RequestSn,
        parameter: impl Into<Bytes>,
    ) -> Self {
        let function_parameter = parameter.into();
        Self {
            command: Command::Request,
            sequence,
            data_length: body_length(function_parameter.len()),
            function_id,
            request_sn,
            function_parameter,
            function_result: Bytes::new(),
            valid: true,
        }
    }

    /// Build a response packet.
    pub fn response(
        sequence: i16,
        function_id: FunctionId,
        request_sn: RequestSn,
        result: impl Into<Bytes>,
    ) -> Self {
        let function_result = result.into();
        Self {
            command: Command::Response,
            sequence,
            data_length: body_length(function_result.len()),
            function_id,
            request_sn,
            function_parameter: Bytes::new(),
            function_result,
            valid: true,
        }
    }

    /// Build a body-less control packet (`Retry`, `Busy`, `Free`).
    pub fn control(command: Command, sequence: i16) -> Self {
        Self {
            command,
            sequence,
            data_length: 0,
            function_id: crate::function::INVALID_FUNCTION,
            request_sn: 0,
            function_parameter: Bytes::new(),
            function_result: Bytes::new(),
            valid: true,
        }
    }

    /// Placeholder returned for malformed input. Only `is_valid` is meaningful.
    pub fn invalid() -> Self {
        Self {
            command: Command::Request,
            sequence: 0,
            data_length: 0,
            function_id: crate::function::INVALID_FUNCTION,
            request_sn: 0,
            function_parameter: Bytes::new(),
            function_result: Bytes::new(),
            valid: false,
        }
    }

    /// Whether the packet passed structural validation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Payload carried by this packet: parameters for requests, result for responses.
    pub fn payload(&self) -> &Bytes {
        match self.command {
            Command::Response => &self.function_result,
            _ => &self.function_parameter,
        }
    }

    /// Encode into the wire format.
    ///
    /// ```text
    /// ┌──────┬─────┬──────────┬─────────────┬──────────────────────────────┬──────┐
    /// │ 0xAA │ cmd │ sequence │ data length │ optional fields              │ 0x55 │
    /// │      │ 1B  │ (i16 LE) │ (i16 LE)    │ REQUEST/RESPONSE:            │      │
    /// │      │     │          │             │ fn id (i32 LE) sn (i32 LE)   │      │
    /// │      │     │          │             │ payload                      │      │
    /// └──────┴─────┴──────────┴─────────────┴──────────────────────────────┴──────┘
    /// ```
    ///
    /// `data_length` is recomputed from the body. No checksum is written;
    /// integrity comes from the frame layer when [`crate::Framing::Framed`] is used.
    pub fn serialize(&self) -> Result<Bytes, PacketError> {
        let mut body = BytesMut::new();
        match self.command {
            Command::Request | Command::Response => {
                body.put_i32_le(self.function_id);
                body.put_i32_le(self.request_sn);
                body.put_slice(self.payload());
            }
            Command::Retry | Command::Busy | Command::Free => {}
        }

        if body.len() > MAX_DATA_LENGTH {
            return Err(PacketError::TooLarge {
                size: body.len(),
                max: MAX_DATA_LENGTH,
            });
        }

        let mut dst = BytesMut::with_capacity(MIN_PACKET_SIZE + body.len());
        dst.put_u8(PACKET_START);
        dst.put_u8(self.command.into());
        dst.put_i16_le(self.sequence);
        dst.put_i16_le(body.len() as i16);
        dst.put_slice(&body);
        dst.put_u8(PACKET_END);
        Ok(dst.freeze())
    }

    /// Decode, returning an invalid packet instead of an error.
    ///
    /// Callers must check [`Packet::is_valid`] before reading any other field.
    pub fn deserialize(raw: &[u8]) -> Self {
        decode_packet(raw).unwrap_or_else(|err| {
            trace!(error = %err, len = raw.len(), "packet rejected");
            Self::invalid()
        })
    }
}

/// Decode a packet from a buffer.
///
/// The buffer is trimmed to the first start marker and the last end marker.
/// The declared data length must account for every byte in between.
pub fn decode_packet(raw: &[u8]) -> Result<Packet, PacketError> {
    let start = raw
        .iter()
        .position(|b| *b == PACKET_START)
        .ok_or(PacketError::MissingMarker)?;
    let end = raw
        .iter()
        .rposition(|b| *b == PACKET_END)
        .filter(|end| *end > start)
        .ok_or(PacketError::MissingMarker)?;
    let span = &raw[start..=end];

    if span.len() < MIN_PACKET_SIZE {
        return Err(PacketError::TooShort {
            len: span.len(),
            min: MIN_PACKET_SIZE,
        });
    }

    let sequence = i16::from_le_bytes([span[2], span[3]]);
    let data_length = i16::from_le_bytes([span[4], span[5]]);
    if data_length < 0 {
        return Err(PacketError::NegativeLength(data_length));
    }
    let declared = data_length as usize;
    let actual = span.len() - MIN_PACKET_SIZE;
    if declared != actual {
        return Err(PacketError::LengthMismatch { declared, actual });
    }

    let command = Command::try_from(span[1]).map_err(|_| PacketError::UnknownCommand(span[1]))?;
    let body = &span[PACKET_HEADER_SIZE..span.len() - 1];

    let mut packet = Packet::control(command, sequence);
    packet.data_length = data_length;

    if let Command::Request | Command::Response = command {
        if body.len() < CALL_FIELDS_SIZE {
            return Err(PacketError::MissingCallFields {
                command: command.name(),
                len: body.len(),
                min: CALL_FIELDS_SIZE,
            });
        }
        packet.function_id = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        packet.request_sn = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        let payload = Bytes::copy_from_slice(&body[CALL_FIELDS_SIZE..]);
        if command == Command::Request {
            packet.function_parameter = payload;
        } else {
            packet.function_result = payload;
        }
    }

    Ok(packet)
}

fn body_length(payload_len: usize) -> i16 {
    (CALL_FIELDS_SIZE + payload_len).min(MAX_DATA_LENGTH) as i16
}
