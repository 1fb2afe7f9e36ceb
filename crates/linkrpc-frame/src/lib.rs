//! Marker/checksum byte framing for raw, ordered, possibly noisy links.
//!
//! Every frame on the wire looks like:
//! - a start marker `0xAA`
//! - a command byte, a 2-byte little-endian frame id, a 2-byte little-endian length
//! - the payload
//! - an XOR checksum over command..payload and an end marker `0x55`
//!
//! The [`StreamReassembler`] carves frames out of a continuous byte stream and
//! resynchronizes on the next start marker after garbage or corruption. The
//! [`FrameEngine`] answers requests and asks for retransmission of anything
//! that fails to decode.

pub mod codec;
pub mod engine;
pub mod error;
pub mod reassembler;

pub use codec::{
    checksum, decode_frame, encode_frame, peek_frame_id, Frame, FrameCommand, FrameConfig,
    END_FLAG, HEADER_SIZE, MAX_PAYLOAD, MIN_FRAME_SIZE, START_FLAG, TRAILER_SIZE,
};
pub use engine::{EngineStats, FrameEngine};
pub use error::{FrameError, Result};
pub use reassembler::{ReassemblerConfig, StreamReassembler, DEFAULT_MAX_BUFFER};
