/// Errors that can occur while handing bytes to a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The send callback reported failure.
    #[error("transport rejected {len} bytes")]
    Rejected { len: usize },

    /// The link has been closed by either side.
    #[error("link closed")]
    Closed,

    /// An I/O error occurred on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
