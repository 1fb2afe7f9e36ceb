//! Point-to-point RPC over raw, ordered, possibly noisy byte links.
//!
//! linkrpc lets two nodes on either end of a serial-style link call each
//! other's functions by id: bytes are framed with markers and an XOR checksum,
//! carved back out of the stream after noise, and correlated into request and
//! response packets routed to a registry of local functions.
//!
//! # Crate Structure
//!
//! - [`transport`]: The send-side `Link` trait, an in-memory duplex link, and `io` adapters
//! - [`frame`]: Marker/checksum framing, stream reassembly, and the retry-aware frame engine
//! - [`node`]: Packets, function registry, remote peer handles, and local node routing (behind `node` feature)

/// Re-export transport types.
pub mod transport {
    pub use linkrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use linkrpc_frame::*;
}

/// Re-export node types (requires `node` feature).
#[cfg(feature = "node")]
pub mod node {
    pub use linkrpc_node::*;
}
