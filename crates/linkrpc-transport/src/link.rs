use std::fmt;

use crate::error::{Result, TransportError};

/// The outbound half of a point-to-point byte channel.
///
/// Implementations must be callable from any thread. `send` hands a complete
/// buffer to the transport; there is no partial-write contract at this level.
pub trait Link: Send + Sync {
    /// Write `bytes` to the wire.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Whether the link can currently accept data.
    fn is_active(&self) -> bool {
        true
    }
}

/// A [`Link`] backed by a `sendBytes(buffer) -> success` callback.
pub struct FnLink<F> {
    on_send: F,
}

/// Wrap a boolean send callback as a [`Link`].
pub fn link_fn<F>(on_send: F) -> FnLink<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    FnLink { on_send }
}

impl<F> Link for FnLink<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn send(&self, bytes: &[u8]) -> Result<()> {
        if (self.on_send)(bytes) {
            Ok(())
        } else {
            Err(TransportError::Rejected { len: bytes.len() })
        }
    }
}

impl<F> fmt::Debug for FnLink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnLink").finish_non_exhaustive()
    }
}

impl<L: Link + ?Sized> Link for std::sync::Arc<L> {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }
}
