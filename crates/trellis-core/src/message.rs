//! Inner messages — the records carried inside envelope CDATA payloads.
//!
//! The multiplexer reads nothing of an inner message beyond its 16-byte
//! header: kind and flags drive the multi-part reply protocol, sequence
//! routes the record to its listener. The body stays opaque and is handed
//! to whichever [`crate::marshal::Marshal`] the client was configured with.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::wire::WireError;

type U16le = U16<LittleEndian>;
type U32le = U32<LittleEndian>;

/// Inner message header length on the wire.
pub const MESSAGE_HEADER_LEN: usize = 16;

/// Multi-part reply terminator.
pub const MSG_DONE: u16 = 0x0003;

/// Failure report from the kernel/peer; body carries the error code.
pub const MSG_ERROR: u16 = 0x0002;

/// Message flags.
pub const MSG_F_REQUEST: u16 = 0x0001;
/// Part of a multi-part reply stream, terminated by [`MSG_DONE`].
pub const MSG_F_MULTI: u16 = 0x0002;
pub const MSG_F_ACK: u16 = 0x0004;
pub const MSG_F_ROOT: u16 = 0x0100;
pub const MSG_F_MATCH: u16 = 0x0200;
pub const MSG_F_ATOMIC: u16 = 0x0400;
/// Full-table dump request.
pub const MSG_F_DUMP: u16 = MSG_F_ROOT | MSG_F_MATCH;

#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct MessageHeaderWire {
    length: U32le,
    kind: U16le,
    flags: U16le,
    sequence: U32le,
    pid: U32le,
}

assert_eq_size!(MessageHeaderWire, [u8; 16]);

/// Parsed inner message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: u16,
    pub flags: u16,
    pub sequence: u32,
    pub pid: u32,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// One inner message as seen by the multiplexer and its callers.
///
/// `header` is `Option` because the dispatcher strips it from returned
/// records unless the client runs in debug mode; `raw` keeps the original
/// wire bytes of a parsed record so mirror mode and re-encoding do not
/// depend on the parsed shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Option<MessageHeader>,
    /// Error code lifted out of a [`MSG_ERROR`] body by the marshal.
    pub error: Option<i32>,
    /// Human-readable event tag, set by `Marshal::fix_message`.
    pub event: Option<&'static str>,
    /// Opaque body bytes, everything after the header.
    pub body: Bytes,
    raw: Option<Bytes>,
}

impl Message {
    /// Build an outbound request. Sequence and pid are filled by the
    /// dispatcher just before serialization.
    pub fn request(kind: u16, flags: u16, body: Bytes) -> Self {
        Message {
            header: Some(MessageHeader {
                kind,
                flags: flags | MSG_F_REQUEST,
                sequence: 0,
                pid: 0,
            }),
            error: None,
            event: None,
            body,
            raw: None,
        }
    }

    pub fn kind(&self) -> u16 {
        self.header.map(|h| h.kind).unwrap_or(0)
    }

    pub fn flags(&self) -> u16 {
        self.header.map(|h| h.flags).unwrap_or(0)
    }

    pub fn sequence(&self) -> u32 {
        self.header.map(|h| h.sequence).unwrap_or(0)
    }

    /// Original wire bytes, present on records that came off the wire or
    /// have been encoded once.
    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    /// Header access for the dispatcher; installs a default header on a
    /// stripped record.
    pub fn header_mut(&mut self) -> &mut MessageHeader {
        self.header.get_or_insert_with(MessageHeader::default)
    }

    /// Drop the transport header, leaving only the payload view.
    pub fn strip_header(&mut self) {
        self.header = None;
    }

    /// Make the record ready for re-encoding: discard the cached wire
    /// bytes so the next [`Message::encode`] rebuilds them.
    pub fn reset(&mut self) {
        self.raw = None;
    }

    /// Serialize header + body, padding to a 4-byte boundary so records can
    /// be packed back to back in one payload. Caches and returns the bytes.
    pub fn encode(&mut self) -> Bytes {
        let header = *self.header_mut();
        let length = MESSAGE_HEADER_LEN + self.body.len();
        let wire = MessageHeaderWire {
            length: U32le::new(length as u32),
            kind: U16le::new(header.kind),
            flags: U16le::new(header.flags),
            sequence: U32le::new(header.sequence),
            pid: U32le::new(header.pid),
        };
        let mut out = BytesMut::with_capacity(align4(length));
        out.put_slice(wire.as_bytes());
        out.put_slice(&self.body);
        out.resize(align4(length), 0);
        let bytes = out.freeze();
        self.raw = Some(bytes.clone());
        bytes
    }

    /// Decode one record off the front of `data`. Returns the record and
    /// the number of bytes consumed (the declared length, 4-byte aligned).
    pub fn decode_prefix(data: &Bytes) -> Result<(Self, usize), WireError> {
        let header = MessageHeaderWire::read_from_prefix(data).ok_or(WireError::TruncatedHeader {
            need: MESSAGE_HEADER_LEN,
            got: data.len(),
        })?;
        let length = header.length.get() as usize;
        if length < MESSAGE_HEADER_LEN {
            return Err(WireError::FramingError(length as u32));
        }
        if length > data.len() {
            return Err(WireError::TruncatedHeader {
                need: length,
                got: data.len(),
            });
        }
        let msg = Message {
            header: Some(MessageHeader {
                kind: header.kind.get(),
                flags: header.flags.get(),
                sequence: header.sequence.get(),
                pid: header.pid.get(),
            }),
            error: None,
            event: None,
            body: data.slice(MESSAGE_HEADER_LEN..length),
            raw: Some(data.slice(..length)),
        };
        Ok((msg, align4(length).min(data.len())))
    }
}
