/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The span lacks a start marker, an end marker, or both.
    #[error("missing frame marker (expected 0xAA ... 0x55)")]
    MissingMarker,

    /// The span is shorter than header + checksum + end marker.
    #[error("frame too short ({len} bytes, min {min})")]
    TooShort { len: usize, min: usize },

    /// The declared payload length does not account for the span size.
    #[error("frame length mismatch (declared payload {declared}, span {actual} bytes)")]
    LengthMismatch { declared: usize, actual: usize },

    /// The trailing checksum does not match the recomputed one.
    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// The command byte is not a known frame command.
    #[error("unknown frame command {0:#04x}")]
    UnknownCommand(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Handing the encoded frame to the link failed.
    #[error("transport error: {0}")]
    Transport(#[from] linkrpc_transport::TransportError),
}

impl FrameError {
    /// Whether this error describes a malformed span (as opposed to a local failure).
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::MissingMarker
                | FrameError::TooShort { .. }
                | FrameError::LengthMismatch { .. }
                | FrameError::ChecksumMismatch { .. }
                | FrameError::UnknownCommand(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
