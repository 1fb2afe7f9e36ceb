use std::sync::atomic::{AtomicI16, AtomicI32, Ordering};
use std::time::Instant;

use bytes::Bytes;

use crate::connection::PeerId;
use crate::function::{FunctionId, FunctionInfo};

/// Caller-assigned request number; the correlation key for responses.
pub type RequestSn = i32;

/// Hands out request numbers: monotonic, wrapping to zero on overflow.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicI32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a given value.
    pub fn starting_at(value: RequestSn) -> Self {
        Self {
            next: AtomicI32::new(value.max(0)),
        }
    }

    /// Take the next number. Safe to call from many threads at once.
    pub fn next(&self) -> RequestSn {
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.checked_add(1).unwrap_or(0))
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

/// Packet sequence counter: wraps to zero instead of going negative.
#[derive(Debug, Default)]
pub(crate) struct PacketSequence {
    next: AtomicI16,
}

impl PacketSequence {
    pub(crate) fn next(&self) -> i16 {
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.checked_add(1).unwrap_or(0))
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

/// Lifecycle of a call this node issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Stored, not yet handed to the link.
    Created,
    /// Handed to the link, awaiting a response.
    Sent,
    /// A response arrived; the result is waiting to be taken.
    Responded,
    /// The result was taken.
    Finished,
    /// Sending failed.
    CallFailed,
}

impl RequestStatus {
    /// Whether a response may still complete this request.
    pub fn is_outstanding(self) -> bool {
        matches!(self, RequestStatus::Created | RequestStatus::Sent)
    }

    pub fn name(self) -> &'static str {
        match self {
            RequestStatus::Created => "created",
            RequestStatus::Sent => "sent",
            RequestStatus::Responded => "responded",
            RequestStatus::Finished => "finished",
            RequestStatus::CallFailed => "call-failed",
        }
    }
}

/// A call issued by this node to a peer.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_sn: RequestSn,
    pub function: FunctionInfo,
    pub outgoing: Bytes,
    pub incoming: Bytes,
    pub status: RequestStatus,
    pub created_at: Instant,
    /// Callers blocked in `wait` on this request; such requests are never reaped.
    pub(crate) waiters: usize,
}

impl Request {
    pub fn new(request_sn: RequestSn, function: FunctionInfo, outgoing: Bytes) -> Self {
        Self {
            request_sn,
            function,
            outgoing,
            incoming: Bytes::new(),
            status: RequestStatus::Created,
            created_at: Instant::now(),
            waiters: 0,
        }
    }
}

/// Lifecycle of a call a peer issued to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteRequestStatus {
    Queued,
    CallFinished,
    CallFailed,
}

/// A call received from a peer, tracked while it is dispatched.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub peer_id: PeerId,
    pub sequence: i16,
    pub request_sn: RequestSn,
    pub function_id: FunctionId,
    pub parameter: Bytes,
    pub result: Bytes,
    pub status: RemoteRequestStatus,
}

impl RemoteRequest {
    pub fn new(
        peer_id: PeerId,
        sequence: i16,
        request_sn: RequestSn,
        function_id: FunctionId,
        parameter: Bytes,
    ) -> Self {
        Self {
            peer_id,
            sequence,
            request_sn,
            function_id,
            parameter,
            result: Bytes::new(),
            status: RemoteRequestStatus::Queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let generator = SequenceGenerator::new();
        assert_eq!(generator.next(), 0);
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 2);
    }

    #[test]
    fn sequence_wraps_to_zero() {
        let generator = SequenceGenerator::starting_at(i32::MAX);
        assert_eq!(generator.next(), i32::MAX);
        assert_eq!(generator.next(), 0);
    }

    #[test]
    fn packet_sequence_wraps_to_zero() {
        let sequence = PacketSequence {
            next: AtomicI16::new(i16::MAX),
        };
        assert_eq!(sequence.next(), i16::MAX);
        assert_eq!(sequence.next(), 0);
    }

    #[test]
    fn concurrent_callers_get_distinct_numbers() {
        let generator = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || (0..500).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for sn in handle.join().unwrap() {
                assert!(seen.insert(sn), "duplicate request number {sn}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn new_request_starts_created() {
        let request = Request::new(3, FunctionInfo::new("f", 1), Bytes::from_static(b"p"));
        assert_eq!(request.status, RequestStatus::Created);
        assert!(request.status.is_outstanding());
        assert!(request.incoming.is_empty());
        assert!(!RequestStatus::Responded.is_outstanding());
    }
}
