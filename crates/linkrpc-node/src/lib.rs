//! RPC correlation layer for linkrpc.
//!
//! A [`LocalNode`] owns a [`FunctionRegistry`] of locally executable
//! functions and a table of [`RemotePeerHandle`]s, one per point-to-point
//! connection. Inbound bytes are decoded into [`Packet`]s and routed either to
//! local dispatch (requests) or to the pending-request table of the peer that
//! issued the call (responses).
//!
//! Peers learn each other's names with a synchronous node-name call, the
//! handshake, right after a connection is attached.

pub mod config;
pub mod connection;
pub mod error;
pub mod function;
pub mod node;
pub mod packet;
pub mod remote;
pub mod request;

pub use config::{Framing, NodeConfig};
pub use connection::{PeerId, PeerSlot, PointToPointConnection};
pub use error::{NodeError, PacketError, Result};
pub use function::{
    FunctionId, FunctionImplementation, FunctionInfo, FunctionRegistry, FunctionStatus,
    INVALID_FUNCTION, MAX_FUNCTION_NAME, REQUEST_AVAILABLE_FUNCTIONS, REQUEST_FUNCTION_STATUS,
    REQUEST_NODE_NAME,
};
pub use node::{LocalNode, NodeStats};
pub use packet::{decode_packet, Command, Packet, PACKET_END, PACKET_HEADER_SIZE, PACKET_START};
pub use remote::{CallOutcome, RemotePeerHandle};
pub use request::{
    RemoteRequest, RemoteRequestStatus, Request, RequestSn, RequestStatus, SequenceGenerator,
};
