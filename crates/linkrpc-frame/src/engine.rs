use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use linkrpc_transport::Link;
use tracing::{debug, warn};

use crate::codec::{decode_frame, encode_frame, peek_frame_id, Frame, FrameCommand, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reassembler::StreamReassembler;

type RequestHandler = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;
type ResponseObserver = Box<dyn Fn(&Frame) + Send + Sync>;

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_decoded: u64,
    pub frames_malformed: u64,
    pub requests_served: u64,
    pub retries_sent: u64,
    pub retransmissions: u64,
}

#[derive(Default)]
struct Counters {
    frames_decoded: AtomicU64,
    frames_malformed: AtomicU64,
    requests_served: AtomicU64,
    retries_sent: AtomicU64,
    retransmissions: AtomicU64,
}

struct LastRequest {
    frame: Frame,
    retransmitted: bool,
}

/// Frame-level request/response engine over one link.
///
/// Inbound bytes are carved into frames and dispatched on the command byte:
/// requests go to the installed handler and are answered with a response
/// carrying the same frame id, and anything that fails to decode is answered
/// with a `Retry` control frame. The receiver decides when a retransmission is
/// needed; the sender only honors one `Retry` per request.
///
/// No lock is held while the link is written to, so a link that delivers
/// synchronously back into this engine is safe.
pub struct FrameEngine<L> {
    link: L,
    config: FrameConfig,
    reassembler: Mutex<StreamReassembler>,
    handler: Option<RequestHandler>,
    on_response: Option<ResponseObserver>,
    next_frame_id: AtomicU16,
    last_request: Mutex<Option<LastRequest>>,
    counters: Counters,
}

impl<L: Link> FrameEngine<L> {
    /// Create an engine with default configuration.
    pub fn new(link: L) -> Self {
        Self::with_config(link, FrameConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(link: L, config: FrameConfig) -> Self {
        Self {
            link,
            reassembler: Mutex::new(StreamReassembler::with_config(config.reassembler)),
            config,
            handler: None,
            on_response: None,
            next_frame_id: AtomicU16::new(0),
            last_request: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Install the handler that answers inbound requests.
    ///
    /// A handler returning `None` has failed and no response is sent.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Install an observer for inbound responses.
    pub fn with_response_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.on_response = Some(Box::new(observer));
        self
    }

    /// Send a request frame and return the frame id it was sent with.
    pub fn send_request(&self, payload: &[u8]) -> Result<u16> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(
            FrameCommand::Request,
            frame_id,
            Bytes::copy_from_slice(payload),
        );
        *lock(&self.last_request) = Some(LastRequest {
            frame: frame.clone(),
            retransmitted: false,
        });
        self.send_frame(&frame)?;
        Ok(frame_id)
    }

    /// Encode and write one frame.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame.wire_size());
        encode_frame(frame.command, frame.frame_id, &frame.payload, &mut buf)?;
        self.link.send(&buf)?;
        Ok(())
    }

    /// Consume bytes that arrived from the wire.
    pub fn on_bytes_received(&self, bytes: &[u8]) {
        let candidates = {
            let mut reassembler = lock(&self.reassembler);
            reassembler.push(bytes);
            let mut candidates = Vec::new();
            while let Some(candidate) = reassembler.next_candidate() {
                candidates.push(candidate);
            }
            candidates
        };

        for candidate in candidates {
            self.dispatch_candidate(&candidate);
        }
    }

    fn dispatch_candidate(&self, candidate: &[u8]) {
        let frame = match decode_frame(candidate) {
            Ok(frame) => frame,
            Err(err) => {
                self.counters.frames_malformed.fetch_add(1, Ordering::Relaxed);
                let frame_id = peek_frame_id(candidate).unwrap_or(0);
                warn!(error = %err, len = candidate.len(), frame_id, "frame parse failed, requesting retry");
                self.send_control(FrameCommand::Retry, frame_id);
                return;
            }
        };

        self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
        debug!(
            command = frame.command.name(),
            frame_id = frame.frame_id,
            payload = frame.payload.len(),
            "frame received"
        );

        match frame.command {
            FrameCommand::Request => {
                let Some(handler) = &self.handler else {
                    debug!(frame_id = frame.frame_id, "no request handler installed");
                    return;
                };
                if frame.payload.is_empty() {
                    return;
                }
                let Some(output) = handler(&frame.payload) else {
                    debug!(frame_id = frame.frame_id, "request handler failed, no response");
                    return;
                };
                self.counters.requests_served.fetch_add(1, Ordering::Relaxed);
                let response = Frame::new(FrameCommand::Response, frame.frame_id, output);
                if let Err(err) = self.send_frame(&response) {
                    warn!(error = %err, frame_id = frame.frame_id, "failed sending response");
                }
            }
            FrameCommand::Response => {
                {
                    let mut last = lock(&self.last_request);
                    if last
                        .as_ref()
                        .is_some_and(|pending| pending.frame.frame_id == frame.frame_id)
                    {
                        *last = None;
                    }
                }
                if let Some(observer) = &self.on_response {
                    observer(&frame);
                }
            }
            FrameCommand::Retry => self.retransmit(frame.frame_id),
            FrameCommand::Busy | FrameCommand::Free => {
                debug!(command = frame.command.name(), "reserved control frame ignored");
            }
        }
    }

    fn retransmit(&self, frame_id: u16) {
        let frame = {
            let mut last = lock(&self.last_request);
            match last.as_mut() {
                Some(pending) if pending.frame.frame_id == frame_id && !pending.retransmitted => {
                    pending.retransmitted = true;
                    pending.frame.clone()
                }
                _ => {
                    debug!(frame_id, "retry for unknown or already retransmitted frame");
                    return;
                }
            }
        };

        self.counters.retransmissions.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.send_frame(&frame) {
            warn!(error = %err, frame_id, "retransmission failed");
        }
    }

    fn send_control(&self, command: FrameCommand, frame_id: u16) {
        let frame = Frame::new(command, frame_id, Bytes::new());
        match self.send_frame(&frame) {
            Ok(()) => {
                if command == FrameCommand::Retry {
                    self.counters.retries_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => warn!(error = %err, command = command.name(), "failed sending control frame"),
        }
    }

    /// Bytes waiting in the receive buffer.
    pub fn buffered(&self) -> usize {
        lock(&self.reassembler).buffered()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            frames_decoded: self.counters.frames_decoded.load(Ordering::Relaxed),
            frames_malformed: self.counters.frames_malformed.load(Ordering::Relaxed),
            requests_served: self.counters.requests_served.load(Ordering::Relaxed),
            retries_sent: self.counters.retries_sent.load(Ordering::Relaxed),
            retransmissions: self.counters.retransmissions.load(Ordering::Relaxed),
        }
    }

    /// Borrow the underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Current configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
