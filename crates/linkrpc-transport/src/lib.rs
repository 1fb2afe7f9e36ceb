//! Byte-transport boundary for linkrpc.
//!
//! The protocol core never opens, configures, or closes a physical device.
//! It talks to the outside world through two narrow interfaces:
//! - outbound: a [`Link`] that accepts a buffer and reports whether it was sent
//! - inbound: whoever owns the device calls back into the core with the bytes it read
//!
//! This crate provides the [`Link`] trait, a closure-backed link, an
//! in-memory [`duplex`] pair for tests and in-process demos, and adapters for
//! any `io::Read`/`io::Write` stream (serial ports, sockets, pipes).

pub mod error;
pub mod link;
pub mod memory;
pub mod stream;

pub use error::{Result, TransportError};
pub use link::{link_fn, FnLink, Link};
pub use memory::{duplex, MemoryEndpoint};
pub use stream::{pump, WriteLink};
