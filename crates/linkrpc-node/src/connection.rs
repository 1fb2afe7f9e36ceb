use std::fmt;
use std::sync::{Arc, OnceLock};

use linkrpc_transport::Link;

/// Node-local identifier of an attached peer.
pub type PeerId = u32;

/// The peer id a node assigned to a connection, shared with whoever feeds
/// the connection's inbound bytes.
///
/// Empty until the connection is attached; bound exactly once.
#[derive(Debug, Clone, Default)]
pub struct PeerSlot(Arc<OnceLock<PeerId>>);

impl PeerSlot {
    pub fn get(&self) -> Option<PeerId> {
        self.0.get().copied()
    }

    /// Bind the id. Returns `false` when the slot was already bound.
    pub(crate) fn bind(&self, peer_id: PeerId) -> bool {
        self.0.set(peer_id).is_ok()
    }
}

/// One ordered byte channel to exactly one peer.
#[derive(Clone)]
pub struct PointToPointConnection {
    link: Arc<dyn Link>,
    slot: PeerSlot,
}

impl PointToPointConnection {
    pub fn new<L: Link + 'static>(link: L) -> Self {
        Self::from_arc(Arc::new(link))
    }

    pub fn from_arc(link: Arc<dyn Link>) -> Self {
        Self {
            link,
            slot: PeerSlot::default(),
        }
    }

    /// Slot the node fills in when the connection is attached.
    pub fn slot(&self) -> PeerSlot {
        self.slot.clone()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.slot.get()
    }

    pub fn send(&self, bytes: &[u8]) -> linkrpc_transport::Result<()> {
        self.link.send(bytes)
    }

    pub fn is_active(&self) -> bool {
        self.link.is_active()
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }
}

impl fmt::Debug for PointToPointConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointToPointConnection")
            .field("peer_id", &self.slot.get())
            .field("active", &self.link.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use linkrpc_transport::link_fn;

    use super::*;

    #[test]
    fn slot_binds_once_and_is_shared() {
        let connection = PointToPointConnection::new(link_fn(|_: &[u8]| true));
        let slot = connection.slot();
        assert_eq!(slot.get(), None);

        assert!(slot.bind(4));
        assert!(!connection.slot().bind(5));
        assert_eq!(connection.peer_id(), Some(4));
    }

    #[test]
    fn send_forwards_to_link() {
        let connection = PointToPointConnection::new(link_fn(|bytes: &[u8]| bytes.len() < 3));
        assert!(connection.send(b"ok").is_ok());
        assert!(connection.send(b"too long").is_err());
        assert!(connection.is_active());
    }
}
