//! Stream reassembly — recovers whole envelopes from an unframed byte
//! stream.
//!
//! The bridge hands over opaque blobs, one per recv, with no alignment to
//! envelope boundaries: a blob may hold several envelopes, a fraction of
//! one, or the tail of the previous blob's frame. The reassembler keeps a
//! carry buffer and walks it by length prefix, emitting complete frames in
//! arrival order.

use bytes::{Bytes, BytesMut};

use crate::wire::WireError;

/// Four-byte frame written to the bridge to unblock and terminate the
/// reader: the little-endian length 4, shorter than any real envelope.
pub const SHUTDOWN_SENTINEL: [u8; 4] = 4u32.to_le_bytes();

/// Minimum bytes needed to read a frame's length prefix.
const PREFIX_LEN: usize = 8;

/// Carry-over frame splitter. Feed blobs with [`Reassembler::extend`], then
/// drain complete frames with [`Reassembler::next_frame`].
#[derive(Debug, Default)]
pub struct Reassembler {
    carry: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler::default()
    }

    /// Append one received blob to the carry buffer.
    pub fn extend(&mut self, blob: &[u8]) {
        self.carry.extend_from_slice(blob);
    }

    /// Next complete frame, if the carry holds one.
    ///
    /// An impossible declared length (< 8) yields `Some(Err(FramingError))`
    /// once and discards the carry, so the stream resyncs on the next blob.
    /// `None` means: wait for more input.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, WireError>> {
        if self.carry.len() < PREFIX_LEN {
            return None;
        }
        let length = u32::from_le_bytes(self.carry[0..4].try_into().unwrap());
        if (length as usize) < PREFIX_LEN {
            self.carry.clear();
            return Some(Err(WireError::FramingError(length)));
        }
        if self.carry.len() < length as usize {
            return None;
        }
        Some(Ok(self.carry.split_to(length as usize).freeze()))
    }

    /// Bytes currently held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}
