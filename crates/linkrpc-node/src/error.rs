use std::time::Duration;

use crate::connection::PeerId;
use crate::function::FunctionId;
use crate::request::RequestSn;

/// Reasons a buffer fails to decode as a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// The buffer lacks a start marker, an end marker, or both.
    #[error("missing packet marker (expected 0xAA ... 0x55)")]
    MissingMarker,

    /// The span is shorter than the fixed header plus end marker.
    #[error("packet too short ({len} bytes, min {min})")]
    TooShort { len: usize, min: usize },

    /// The declared data length is negative.
    #[error("negative data length {0}")]
    NegativeLength(i16),

    /// The declared data length does not match the span.
    #[error("data length mismatch (declared {declared}, actual {actual})")]
    LengthMismatch { declared: usize, actual: usize },

    /// A request/response lacks its function id and request number.
    #[error("{command} packet carries {len} data bytes, needs at least {min}")]
    MissingCallFields {
        command: &'static str,
        len: usize,
        min: usize,
    },

    /// The command byte is unknown.
    #[error("unknown packet command {0:#04x}")]
    UnknownCommand(u8),

    /// The optional fields do not fit the 16-bit data length.
    #[error("packet data too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Errors that can occur in node and peer operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] linkrpc_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] linkrpc_frame::FrameError),

    /// Packet encoding/decoding error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// A call was issued with an invalid function identity.
    #[error("invalid function '{0}'")]
    InvalidFunction(String),

    /// The function name or id is already registered.
    #[error("function '{name}' (id {id}) conflicts with an existing registration")]
    DuplicateFunction { name: String, id: FunctionId },

    /// The name does not fit the catalog's 16-bit length field.
    #[error("function name of {len} bytes exceeds {max}")]
    FunctionNameTooLong { len: usize, max: usize },

    /// Negative ids belong to built-in functions.
    #[error("function id {0} is reserved for built-ins")]
    ReservedFunctionId(FunctionId),

    /// The connection is already attached under this peer id.
    #[error("connection already attached as peer {0}")]
    AlreadyAttached(PeerId),

    /// No peer is registered under this id.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Sending a request failed; the request is marked failed.
    #[error("request {request_sn} could not be sent: {source}")]
    SendFailed {
        request_sn: RequestSn,
        source: Box<NodeError>,
    },

    /// The request is unknown or was already reclaimed.
    #[error("unknown request {0}")]
    UnknownRequest(RequestSn),

    /// The request reached the failed state.
    #[error("request {0} failed")]
    CallFailed(RequestSn),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A built-in reply could not be decoded.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Invalid configuration document.
    #[error("invalid node config: {0}")]
    Config(#[from] serde_json::Error),

    /// Reading a configuration file failed.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
