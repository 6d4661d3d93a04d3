//! Cell envelope and binary codec.
//!
//! A `Cell` is the framed, addressed unit that carries one chunk of a
//! stream's payload across the shaped channel. Cells travel as the
//! plaintext of format-transforming encryption, so the marshaled form is
//! padded up to the cipher's capacity to keep every ciphertext the same
//! shape.
//!
//! Layout on the wire (all integers big endian):
//!
//! ```text
//! [total len: 4][payload len: 4][uuid: 4][instance id: 4]
//! [stream id: 4][sequence id: 4][payload: var][padding: var]
//! ```
//!
//! `total len` includes the 24-byte header. `unmarshal` rejects cells whose
//! declared sizes are inconsistent or exceed [`MAX_CELL_LEN`].

use bytes::BufMut;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// Maximum length in bytes of a marshaled cell.
pub const MAX_CELL_LEN: usize = 262_144;

/// Fixed 24-byte cell header (big endian network byte order).
///
/// Fields are stored as raw byte arrays so the struct can be cast directly
/// from untrusted input: every bit pattern is a valid header and the real
/// validation happens in [`Cell::unmarshal`].
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct CellHeader {
    total_len: [u8; 4],
    payload_len: [u8; 4],
    uuid: [u8; 4],
    instance_id: [u8; 4],
    stream_id: [u8; 4],
    sequence_id: [u8; 4],
}

impl CellHeader {
    const SIZE: usize = 24;

    fn total_len(&self) -> u32 {
        u32::from_be_bytes(self.total_len)
    }

    fn payload_len(&self) -> u32 {
        u32::from_be_bytes(self.payload_len)
    }
}

/// One framed payload chunk, bound to its document, session, and stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Document identifier shared by both peers
    pub uuid: u32,
    /// Session nonce chosen by the first sender
    pub instance_id: u32,
    /// Target stream; 0 is the control carrier
    pub stream_id: u32,
    /// Position of the payload within the stream
    pub sequence_id: u32,
    /// Payload bytes; empty on a nonzero stream marks end of stream
    pub payload: Vec<u8>,
    /// Marshaled size including header and padding
    pub len: usize,
}

impl Cell {
    /// Size of the fixed header in bytes.
    pub const HEADER_LEN: usize = CellHeader::SIZE;

    /// Creates an unpadded cell; identity fields start at zero and are
    /// stamped by the sender.
    #[must_use]
    pub fn new(stream_id: u32, sequence_id: u32, payload: Vec<u8>) -> Self {
        let len = Self::HEADER_LEN + payload.len();
        Self { uuid: 0, instance_id: 0, stream_id, sequence_id, payload, len }
    }

    /// Creates a cell padded up to `len` marshaled bytes. Lengths below the
    /// minimum are raised to it.
    #[must_use]
    pub fn padded(stream_id: u32, sequence_id: u32, payload: Vec<u8>, len: usize) -> Self {
        let mut cell = Self::new(stream_id, sequence_id, payload);
        cell.len = cell.len.max(len);
        cell
    }

    /// True when this cell closes its stream.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.stream_id != 0 && self.payload.is_empty()
    }

    /// Encodes the cell, zero-padded to its target length.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CellTooLarge`] when the target length
    /// exceeds [`MAX_CELL_LEN`].
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let total = self.len.max(Self::HEADER_LEN + self.payload.len());
        if total > MAX_CELL_LEN {
            return Err(ProtocolError::CellTooLarge { size: total, max: MAX_CELL_LEN });
        }

        #[allow(clippy::cast_possible_truncation)]
        let header = CellHeader {
            total_len: (total as u32).to_be_bytes(),
            payload_len: (self.payload.len() as u32).to_be_bytes(),
            uuid: self.uuid.to_be_bytes(),
            instance_id: self.instance_id.to_be_bytes(),
            stream_id: self.stream_id.to_be_bytes(),
            sequence_id: self.sequence_id.to_be_bytes(),
        };

        let mut buf = Vec::with_capacity(total);
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.put_bytes(0, total - buf.len());
        Ok(buf)
    }

    /// Decodes one cell from the start of `data`, discarding padding.
    /// Trailing bytes beyond the declared total length are ignored.
    ///
    /// # Errors
    ///
    /// Rejects headers whose declared sizes are inconsistent, exceed
    /// [`MAX_CELL_LEN`], or claim more bytes than `data` holds.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let header = CellHeader::ref_from_prefix(data)
            .map_err(|_| ProtocolError::CellTooShort {
                expected: Self::HEADER_LEN,
                actual: data.len(),
            })?
            .0;

        let total = header.total_len() as usize;
        if total > MAX_CELL_LEN {
            return Err(ProtocolError::CellTooLarge { size: total, max: MAX_CELL_LEN });
        }
        if total < Self::HEADER_LEN {
            return Err(ProtocolError::LengthBelowHeader(total));
        }

        let payload_len = header.payload_len() as usize;
        if payload_len > total - Self::HEADER_LEN {
            return Err(ProtocolError::PayloadOverflow { payload: payload_len, total });
        }
        if data.len() < total {
            return Err(ProtocolError::CellTruncated { expected: total, actual: data.len() });
        }

        Ok(Self {
            uuid: u32::from_be_bytes(header.uuid),
            instance_id: u32::from_be_bytes(header.instance_id),
            stream_id: u32::from_be_bytes(header.stream_id),
            sequence_id: u32::from_be_bytes(header.sequence_id),
            payload: data[Self::HEADER_LEN..Self::HEADER_LEN + payload_len].to_vec(),
            len: total,
        })
    }
}
