//! Error surface shared by every layer of the transport stack.
//!
//! Runtime link failures are reported as events; this type covers the
//! conditions a caller can act on directly: exhausted resources, misuse of a
//! channel or priority, and a transport that has already shut down.

use std::io;

use thiserror::Error;
use transport_codecs::FrameError;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Pool resource that ran out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// Transaction objects.
    Transactions,
    /// Buffers of the short class.
    ShortBuffers,
    /// Buffers of the long class.
    LongBuffers,
}

/// Errors surfaced to transport callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The pool has no free object of the requested kind; treat as backpressure.
    #[error("pool exhausted: no free {0:?}")]
    NoResource(Resource),

    /// Requested buffer is larger than the largest buffer class.
    #[error("buffer of {requested} bytes exceeds largest pool class of {maximum} bytes")]
    BufferTooLarge { requested: usize, maximum: usize },

    /// A transaction cannot carry more data segments.
    #[error("transaction already carries {0} segments")]
    TooManySegments(usize),

    /// Channel number outside the configured table.
    #[error("channel {channel} outside table of {max} entries")]
    InvalidChannel { channel: u8, max: usize },

    /// Priority outside the configured range.
    #[error("priority {priority} outside 0..{max}")]
    InvalidPriority { priority: u8, max: u8 },

    /// Queue function has not been opened.
    #[error("queue function {0} is not open")]
    FunctionNotOpen(u8),

    /// The transport was shut down or its I/O thread exited.
    #[error("transport is closed")]
    Closed,

    /// Waiting for a completion timed out.
    #[error("timed out waiting for completion")]
    Timeout,

    /// UART port failure.
    #[error("uart i/o error: {0}")]
    Io(#[from] io::Error),

    /// Malformed wire frame.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Configuration rejected during validation or parsing.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        TransportError::InvalidConfig(msg.into())
    }
}
