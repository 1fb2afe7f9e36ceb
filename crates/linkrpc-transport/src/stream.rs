use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::link::Link;

const READ_CHUNK_SIZE: usize = 1024;

/// A [`Link`] that writes to any blocking `io::Write` stream.
///
/// The writer is serialized behind a mutex so several callers can share one
/// device handle.
pub struct WriteLink<W> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WriteLink<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Consume the link and return the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> Link for WriteLink<W> {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut offset = 0usize;
        while offset < bytes.len() {
            match inner.write(&bytes[offset..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        loop {
            match inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

impl<W> fmt::Debug for WriteLink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLink").finish_non_exhaustive()
    }
}

/// Read from `reader` until EOF, handing every chunk to `on_bytes`.
///
/// This is the "bytes arrived from the wire" side of the boundary: run it on
/// a dedicated thread per device and forward into the protocol core.
/// Returns the total number of bytes read.
pub fn pump<R, F>(mut reader: R, mut on_bytes: F) -> Result<u64>
where
    R: Read,
    F: FnMut(&[u8]),
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Io(err)),
        };

        if read == 0 {
            debug!(total, "stream reached EOF");
            return Ok(total);
        }

        total += read as u64;
        on_bytes(&chunk[..read]);
    }
}
