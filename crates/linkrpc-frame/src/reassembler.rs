use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::{decode_frame, Frame, END_FLAG, HEADER_SIZE, MAX_PAYLOAD, START_FLAG, TRAILER_SIZE};
use crate::error::Result;

/// Default receive buffer bound: one maximum-size frame.
pub const DEFAULT_MAX_BUFFER: usize = HEADER_SIZE + MAX_PAYLOAD + TRAILER_SIZE;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Receive-side buffering limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblerConfig {
    /// Bytes kept while waiting for an end marker. Oldest bytes are discarded
    /// once the buffer grows beyond this.
    pub max_buffer: usize,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

/// Carves frame candidates out of a continuous byte stream.
///
/// Each pass looks for the first start marker and then for an end marker
/// after it. If the header is complete and its declared length lands on an
/// end marker, that exact span is the candidate. Otherwise the first later
/// start marker whose declared length does land on an end marker wins, and
/// the false start is dropped with the rest of the garbage before it. Only
/// when no start marker frames cleanly does the last end marker in the
/// buffer close the candidate.
///
/// A partially received frame whose header or payload happens to contain
/// `0x55` is carved at that byte and fails to decode. The frame is lost and
/// the sender is asked to retry; the next start marker resynchronizes.
pub struct StreamReassembler {
    buf: BytesMut,
    config: ReassemblerConfig,
}

impl StreamReassembler {
    /// Create a reassembler with default configuration.
    pub fn new() -> Self {
        Self::with_config(ReassemblerConfig::default())
    }

    /// Create a reassembler with explicit configuration.
    pub fn with_config(config: ReassemblerConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY.min(config.max_buffer)),
            config,
        }
    }

    /// Append received bytes to the buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        trace!(buffered = self.buf.len(), rx = ?self.buf.as_ref(), "rx buffer");

        if self.buf.len() > self.config.max_buffer {
            let excess = self.buf.len() - self.config.max_buffer;
            warn!(
                discarded = excess,
                max = self.config.max_buffer,
                "receive buffer over limit, discarding oldest bytes"
            );
            self.buf.advance(excess);
        }
    }

    /// Remove and return the next frame candidate, if one is complete.
    ///
    /// The candidate spans from a start marker to an end marker inclusive.
    /// Returns `None` once the buffer holds no further candidate; any
    /// leading garbage has been dropped by then.
    pub fn next_candidate(&mut self) -> Option<Bytes> {
        let Some(start) = self.buf.iter().position(|b| *b == START_FLAG) else {
            if !self.buf.is_empty() {
                debug!(discarded = self.buf.len(), "no start flag, flushing buffer");
                self.buf.clear();
            }
            return None;
        };

        let (start, end) = match self.declared_end(start) {
            Some(end) => (start, end),
            None => match self.framed_start_after(start) {
                Some((resync, end)) => {
                    debug!(false_start = start, resync, "start flag without a frame, resynchronizing");
                    (resync, end)
                }
                None => match self.last_end_flag(start) {
                    Some(end) => (start, end),
                    None => {
                        if start > 0 {
                            debug!(discarded = start, "no end flag yet, dropping bytes before start flag");
                            self.buf.advance(start);
                        }
                        return None;
                    }
                },
            },
        };

        let mut candidate = self.buf.split_to(end + 1);
        if start > 0 {
            debug!(discarded = start, "dropping garbage before start flag");
            candidate.advance(start);
        }
        Some(candidate.freeze())
    }

    /// Append bytes and decode every candidate they complete, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Frame>> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(candidate) = self.next_candidate() {
            frames.push(decode_frame(&candidate));
        }
        frames
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Current configuration.
    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    /// First start flag after `after` whose declared length closes on an end flag.
    fn framed_start_after(&self, after: usize) -> Option<(usize, usize)> {
        (after + 1..self.buf.len())
            .filter(|&i| self.buf[i] == START_FLAG)
            .find_map(|i| self.declared_end(i).map(|end| (i, end)))
    }

    fn last_end_flag(&self, start: usize) -> Option<usize> {
        self.buf[start + 1..]
            .iter()
            .rposition(|b| *b == END_FLAG)
            .map(|offset| start + 1 + offset)
    }

    fn declared_end(&self, start: usize) -> Option<usize> {
        let header = self.buf.get(start..start + HEADER_SIZE)?;
        let declared = u16::from_le_bytes([header[4], header[5]]) as usize;
        let end = start + HEADER_SIZE + declared + TRAILER_SIZE - 1;
        (self.buf.get(end) == Some(&END_FLAG)).then_some(end)
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReassembler")
            .field("buffered", &self.buf.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, FrameCommand};
    use crate::error::FrameError;

    fn wire(frame_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(FrameCommand::Request, frame_id, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    fn ok_frames(results: Vec<Result<Frame>>) -> Vec<Frame> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn single_frame() {
        let mut reassembler = StreamReassembler::new();
        let frames = ok_frames(reassembler.feed(&wire(1, b"hello")));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"hello");
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn garbage_then_frame_yields_exactly_that_frame() {
        let valid = wire(3, b"payload");
        let mut stream = vec![0x00, 0x13, 0x37, 0x42];
        stream.extend_from_slice(&valid);

        let mut reassembler = StreamReassembler::new();
        let frames = ok_frames(reassembler.feed(&stream));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_bytes().unwrap().as_ref(), valid.as_slice());
    }

    #[test]
    fn frame_garbage_frame_yields_both_in_order() {
        let mut stream = wire(1, b"first");
        stream.extend_from_slice(&[0x01, 0x02, 0x55, 0x03]);
        stream.extend_from_slice(&wire(2, b"second"));

        let mut reassembler = StreamReassembler::new();
        let frames = ok_frames(reassembler.feed(&stream));
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].frame_id, frames[0].payload.as_ref()), (1, b"first".as_ref()));
        assert_eq!((frames[1].frame_id, frames[1].payload.as_ref()), (2, b"second".as_ref()));
    }

    #[test]
    fn start_flag_in_garbage_does_not_swallow_next_frame() {
        let valid = wire(3, b"payload");
        let mut stream = vec![0x00, START_FLAG, 0x13];
        stream.extend_from_slice(&valid);

        let mut reassembler = StreamReassembler::new();
        let frames = ok_frames(reassembler.feed(&stream));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_bytes().unwrap().as_ref(), valid.as_slice());
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn start_flag_between_frames_keeps_both() {
        let mut stream = wire(1, b"first");
        stream.extend_from_slice(&[START_FLAG, 0x02]);
        stream.extend_from_slice(&wire(2, b"second"));

        let mut reassembler = StreamReassembler::new();
        let frames = ok_frames(reassembler.feed(&stream));
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].frame_id, frames[0].payload.as_ref()), (1, b"first".as_ref()));
        assert_eq!((frames[1].frame_id, frames[1].payload.as_ref()), (2, b"second".as_ref()));
    }

    #[test]
    fn start_flag_in_garbage_then_frame_byte_by_byte() {
        let valid = wire(5, b"late");
        let mut stream = vec![START_FLAG, 0x07];
        stream.extend_from_slice(&valid);

        let mut reassembler = StreamReassembler::new();
        let mut results = Vec::new();
        for byte in &stream {
            results.extend(reassembler.feed(std::slice::from_ref(byte)));
        }
        let frames = ok_frames(results);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"late");
    }

    #[test]
    fn frames_fed_in_separate_chunks_with_garbage_between() {
        let mut reassembler = StreamReassembler::new();
        let first = ok_frames(reassembler.feed(&wire(1, b"one")));
        assert!(reassembler.feed(&[0x10, 0x20, 0x30]).is_empty());
        let second = ok_frames(reassembler.feed(&wire(2, b"two")));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload.as_ref(), b"two");
    }

    #[test]
    fn frame_split_across_pushes() {
        let frame = wire(4, b"split");
        let (head, tail) = frame.split_at(3);

        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.feed(head).is_empty());
        assert_eq!(reassembler.buffered(), 3);

        let frames = ok_frames(reassembler.feed(tail));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"split");
    }

    #[test]
    fn byte_by_byte_arrival() {
        let payload = b"slow";
        let frame = wire(0x0102, payload);
        // No end marker may appear before the real one for this to survive.
        assert!(!frame[..frame.len() - 1].contains(&END_FLAG));

        let mut reassembler = StreamReassembler::new();
        let mut frames = Vec::new();
        for byte in &frame {
            frames.extend(reassembler.feed(std::slice::from_ref(byte)));
        }
        let frames = ok_frames(frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), payload);
    }

    #[test]
    fn stray_end_marker_in_partial_frame_loses_that_frame() {
        let frame = wire(9, &[0x01, END_FLAG, 0x02]);
        let (head, tail) = frame.split_at(HEADER_SIZE + 2);

        let mut reassembler = StreamReassembler::new();
        let results = reassembler.feed(head);
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().is_err());

        // The remainder has no start flag and is flushed as garbage.
        assert!(reassembler.feed(tail).is_empty());
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn only_garbage_is_flushed() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.feed(&[0x01, 0x02, 0x03]).is_empty());
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn start_without_end_keeps_tail_from_start() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.feed(&[0x01, 0x02, START_FLAG, 0x00]).is_empty());
        assert_eq!(reassembler.buffered(), 2);
    }

    #[test]
    fn corrupted_frame_reports_error_and_resynchronizes() {
        let mut corrupted = wire(1, b"bad");
        corrupted[HEADER_SIZE] ^= 0x01;
        let mut stream = corrupted;
        stream.extend_from_slice(&wire(2, b"good"));

        let mut reassembler = StreamReassembler::new();
        let results = reassembler.feed(&stream);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(FrameError::ChecksumMismatch { .. })));
        assert_eq!(results[1].as_ref().unwrap().payload.as_ref(), b"good");
    }

    #[test]
    fn buffer_limit_discards_oldest_bytes() {
        let mut reassembler = StreamReassembler::with_config(ReassemblerConfig { max_buffer: 8 });
        reassembler.push(&[START_FLAG; 12]);
        assert_eq!(reassembler.buffered(), 8);
    }

    #[test]
    fn clear_resets_buffer() {
        let mut reassembler = StreamReassembler::new();
        reassembler.push(&[START_FLAG, 0x00]);
        reassembler.clear();
        assert_eq!(reassembler.buffered(), 0);
        assert_eq!(reassembler.config().max_buffer, DEFAULT_MAX_BUFFER);
    }
}
