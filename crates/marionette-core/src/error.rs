//! Error types for the engine and its drivers.
//!
//! Three kinds are recovered locally: `NoTransition` (the execute loop
//! waits and retries), `RetryTransition` (the current step is re-run after
//! the instance id was just learned), and `StreamClosed` (the driver
//! recycles the machine for a new cycle). Everything else unwinds to the
//! driver, which closes the machine.

use std::io;

use marionette_proto::ProtocolError;
use thiserror::Error;

/// Errors produced or propagated by the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// No transition from the current state succeeded
    #[error("no matching transition")]
    NoTransition,

    /// The instance id was just learned; the current step must re-run
    #[error("transition must be retried")]
    RetryTransition,

    /// An action observed end of stream; the driver starts a new cycle
    #[error("stream closed")]
    StreamClosed,

    /// Received cell belongs to a different document
    #[error("uuid mismatch: cell {cell:#010x}, document {document:#010x}")]
    UuidMismatch {
        /// Uuid carried by the cell
        cell: u32,
        /// Uuid of the local document
        document: u32,
    },

    /// Received cell carries a different session nonce
    #[error("instance id mismatch: cell {cell}, fsm {fsm}")]
    InstanceIdMismatch {
        /// Instance id carried by the cell
        cell: u32,
        /// Instance id of the local machine
        fsm: u32,
    },

    /// Plugin lookup failed
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// A transition names an action block the document does not define
    #[error("action block not found: {0:?}")]
    ActionBlockNotFound(String),

    /// A plugin received arguments of the wrong shape
    #[error("invalid action arguments: {0}")]
    InvalidArguments(String),

    /// An action guard pattern failed to compile
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    /// The cipher engine failed
    #[error("cipher error: {0}")]
    Cipher(String),

    /// The read cursor was advanced past the peeked bytes
    #[error("seek beyond buffered data: {n} > {buffered}")]
    SeekBeyondBuffer {
        /// Requested advance
        n: usize,
        /// Bytes currently buffered
        buffered: usize,
    },

    /// The document cannot be used as requested
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Operation on a closed dialer
    #[error("dialer closed")]
    DialerClosed,

    /// The session was cancelled while an operation was in flight
    #[error("connection cancelled")]
    Cancelled,

    /// Cell codec violation
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Underlying transport failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that unwind to the driver. The three recoverable
    /// kinds are handled inside the engine and driver loops.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NoTransition | Error::RetryTransition | Error::StreamClosed)
    }
}

/// Convenient Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
