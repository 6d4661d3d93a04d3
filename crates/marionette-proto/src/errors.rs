//! Error types for the marionette wire layer.
//!
//! All errors are structured and testable. Codec violations carry the
//! offending sizes so rejections can be asserted precisely.

use thiserror::Error;

/// Violations of the cell codec or document constraints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input is shorter than the fixed cell header
    #[error("cell too short: expected at least {expected} bytes, got {actual}")]
    CellTooShort {
        /// Minimum size in bytes
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared total length exceeds the maximum cell length
    #[error("cell too large: {size} bytes exceeds maximum {max}")]
    CellTooLarge {
        /// Declared total size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Declared total length is smaller than the header itself
    #[error("cell length {0} is below the header size")]
    LengthBelowHeader(usize),

    /// Declared payload does not fit inside the declared total length
    #[error("payload length {payload} exceeds cell length {total} minus header")]
    PayloadOverflow {
        /// Declared payload size
        payload: usize,
        /// Declared total size
        total: usize,
    },

    /// Input ends before the declared total length
    #[error("cell truncated: header claims {expected} total bytes, but only {actual} available")]
    CellTruncated {
        /// Total size claimed by the header
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Stream id 0 is the control carrier and never reaches a user stream
    #[error("stream id 0 is reserved")]
    ReservedStreamId,
}

/// Convenient Result type alias for wire operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
