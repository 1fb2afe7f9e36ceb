//! In-memory duplex link.
//!
//! Bytes sent on one endpoint are delivered synchronously, on the sender's
//! thread, to the receiver installed on the other endpoint. Bytes sent before
//! a receiver is installed are held in a backlog and flushed on install.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::link::Link;

type Receiver = Arc<dyn Fn(&[u8]) + Send + Sync>;
type Interceptor = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct InboxState {
    receiver: Option<Receiver>,
    backlog: Vec<Bytes>,
}

#[derive(Default)]
struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    fn deliver(&self, bytes: &[u8]) {
        let receiver = {
            let mut state = lock(&self.state);
            match &state.receiver {
                Some(receiver) => Arc::clone(receiver),
                None => {
                    state.backlog.push(Bytes::copy_from_slice(bytes));
                    return;
                }
            }
        };
        receiver(bytes);
    }
}

/// One end of an in-memory point-to-point link.
pub struct MemoryEndpoint {
    label: &'static str,
    inbox: Arc<Inbox>,
    remote: Arc<Inbox>,
    open: Arc<AtomicBool>,
    interceptor: Mutex<Option<Interceptor>>,
}

/// Create a connected pair of in-memory endpoints.
pub fn duplex() -> (MemoryEndpoint, MemoryEndpoint) {
    let left_inbox = Arc::new(Inbox::default());
    let right_inbox = Arc::new(Inbox::default());
    let open = Arc::new(AtomicBool::new(true));

    let left = MemoryEndpoint {
        label: "left",
        inbox: Arc::clone(&left_inbox),
        remote: Arc::clone(&right_inbox),
        open: Arc::clone(&open),
        interceptor: Mutex::new(None),
    };
    let right = MemoryEndpoint {
        label: "right",
        inbox: right_inbox,
        remote: left_inbox,
        open,
        interceptor: Mutex::new(None),
    };
    (left, right)
}

impl MemoryEndpoint {
    /// Install the callback that receives bytes sent by the other endpoint.
    ///
    /// Any backlog accumulated before installation is delivered immediately,
    /// in order, on the calling thread.
    pub fn set_receiver<F>(&self, receiver: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let receiver: Receiver = Arc::new(receiver);
        let backlog = {
            let mut state = lock(&self.inbox.state);
            state.receiver = Some(Arc::clone(&receiver));
            std::mem::take(&mut state.backlog)
        };
        for bytes in backlog {
            receiver(&bytes);
        }
    }

    /// Rewrite every outgoing buffer before delivery (noise injection in tests).
    pub fn set_interceptor<F>(&self, interceptor: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        *lock(&self.interceptor) = Some(Arc::new(interceptor));
    }

    /// Close both directions of the link.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Link for MemoryEndpoint {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        trace!(endpoint = self.label, len = bytes.len(), "memory link send");

        let interceptor = lock(&self.interceptor).clone();
        match interceptor {
            Some(rewrite) => self.remote.deliver(&rewrite(bytes)),
            None => self.remote.deliver(bytes),
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("label", &self.label)
            .field("open", &self.is_active())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
