//! Trellis wire format — the outer envelope carried on the bridge.
//!
//! Every datagram exchanged with the transport core is one envelope: a
//! 24-byte little-endian header followed by a type-length-value attribute
//! list. The payload proper travels as a single CDATA attribute whose bytes
//! are opaque to this layer — the envelope codec frames, multiplexes, and
//! correlates; it never interprets what it carries.
//!
//! All header types are #[repr(C)] over explicit little-endian integers and
//! use zerocopy derives for safe, allocation-free serialization. There is no
//! unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type U16le = U16<LittleEndian>;
type U32le = U32<LittleEndian>;

// ── Envelope Header ──────────────────────────────────────────────────────────

/// Fixed prefix of every envelope.
///
/// `length` counts the whole envelope, header included. `sequence` ties a
/// reply stream back to its request; zero marks unsolicited broadcast
/// traffic. `src` and `dst` are realm identifiers multiplexing the stream
/// across upstream peers.
///
/// Wire size: 24 bytes, little-endian.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    /// Total envelope length in bytes (header + attributes).
    pub length: U32le,

    /// Envelope kind: [`ENV_TRANSPORT`] for user traffic, [`ENV_CONTROL`]
    /// for management exchanges.
    pub kind: U16le,

    /// Envelope flags. [`ENV_F_CONTROL`] marks a management reply whose
    /// payload decodes as a control record rather than through the marshal.
    pub flags: U16le,

    /// Request correlator. 0 = unsolicited broadcast.
    pub sequence: U32le,

    /// Process identifier of the sender.
    pub pid: U32le,

    /// Source realm.
    pub src: U32le,

    /// Destination realm.
    pub dst: U32le,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(EnvelopeHeader, [u8; 24]);

/// Envelope header length on the wire.
pub const ENVELOPE_HEADER_LEN: usize = 24;

/// Envelope kind: user traffic.
pub const ENV_TRANSPORT: u16 = 0x00f0;

/// Envelope kind: management traffic.
pub const ENV_CONTROL: u16 = 0x00e0;

/// Envelope flag distinguishing a management reply from a user-data reply.
pub const ENV_F_CONTROL: u16 = 0x0001;

// ── Attributes ───────────────────────────────────────────────────────────────

/// Attribute kinds understood by the envelope layer.
///
/// The wire carries the numeric value; everything above this module refers
/// to attributes by symbolic name only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttrKind {
    /// Opaque inner-message bytes. The one attribute the core routes on.
    Cdata = 1,
    /// Peer locator string for connect/serve/shutdown.
    Host = 2,
    /// Realm address.
    Addr = 3,
    /// SSL credential blobs, forwarded untouched.
    SslKey = 4,
    SslCert = 5,
    SslCa = 6,
    /// Subscription channel id returned by SUBSCRIBE.
    Cid = 7,
    /// Subscription match key.
    SubKey = 8,
}

impl TryFrom<u16> for AttrKind {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            1 => Ok(AttrKind::Cdata),
            2 => Ok(AttrKind::Host),
            3 => Ok(AttrKind::Addr),
            4 => Ok(AttrKind::SslKey),
            5 => Ok(AttrKind::SslCert),
            6 => Ok(AttrKind::SslCa),
            7 => Ok(AttrKind::Cid),
            8 => Ok(AttrKind::SubKey),
            other => Err(WireError::UnknownAttribute(other)),
        }
    }
}

/// Subscription match key carried by SUBSCRIBE requests: compare `key`
/// against the u32 at `offset` of each message under `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionKey {
    pub offset: u32,
    pub key: u32,
    pub mask: u32,
}

/// Attribute values as a closed discriminated union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Bytes(Bytes),
    Str(String),
    U32(u32),
    SubKey(SubscriptionKey),
}

impl AttrValue {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            AttrValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            AttrValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    fn encode_into(&self, out: &mut BytesMut) {
        match self {
            AttrValue::Bytes(b) => out.put_slice(b),
            AttrValue::Str(s) => out.put_slice(s.as_bytes()),
            AttrValue::U32(v) => out.put_u32_le(*v),
            AttrValue::SubKey(k) => {
                out.put_u32_le(k.offset);
                out.put_u32_le(k.key);
                out.put_u32_le(k.mask);
            }
        }
    }
}

impl AttrKind {
    /// Interpret raw value bytes according to this kind's representation.
    fn decode_value(self, raw: &[u8]) -> Result<AttrValue, WireError> {
        match self {
            AttrKind::Cdata => Ok(AttrValue::Bytes(Bytes::copy_from_slice(raw))),
            AttrKind::Host | AttrKind::SslKey | AttrKind::SslCert | AttrKind::SslCa => {
                let s = std::str::from_utf8(raw).map_err(|_| WireError::AttrValueMismatch(self))?;
                Ok(AttrValue::Str(s.to_owned()))
            }
            AttrKind::Addr | AttrKind::Cid => {
                let arr: [u8; 4] = raw.try_into().map_err(|_| WireError::AttrValueMismatch(self))?;
                Ok(AttrValue::U32(u32::from_le_bytes(arr)))
            }
            AttrKind::SubKey => {
                if raw.len() != 12 {
                    return Err(WireError::AttrValueMismatch(self));
                }
                Ok(AttrValue::SubKey(SubscriptionKey {
                    offset: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
                    key: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
                    mask: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
                }))
            }
        }
    }
}

/// TLV header length: u16 length (covering this header) + u16 kind.
const ATTR_HEADER_LEN: usize = 4;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Encode an attribute list in TLV form. Shared between envelopes and
/// management message bodies, which use the same grammar.
pub fn encode_attrs(attrs: &[(AttrKind, AttrValue)], out: &mut BytesMut) {
    for (kind, value) in attrs {
        let start = out.len();
        out.put_u16_le(0); // patched below
        out.put_u16_le(*kind as u16);
        value.encode_into(out);
        let alen = out.len() - start;
        out[start..start + 2].copy_from_slice(&(alen as u16).to_le_bytes());
        out.resize(start + align4(alen), 0);
    }
}

/// Decode a TLV attribute list covering all of `data`.
pub fn decode_attrs(data: &[u8]) -> Result<Vec<(AttrKind, AttrValue)>, WireError> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < ATTR_HEADER_LEN {
            return Err(WireError::MalformedEnvelope("truncated attribute header"));
        }
        let alen = u16::from_le_bytes(rest[0..2].try_into().unwrap()) as usize;
        let akind = u16::from_le_bytes(rest[2..4].try_into().unwrap());
        if alen < ATTR_HEADER_LEN || alen > rest.len() {
            return Err(WireError::MalformedEnvelope("attribute length out of range"));
        }
        let kind = AttrKind::try_from(akind)?;
        attrs.push((kind, kind.decode_value(&rest[ATTR_HEADER_LEN..alen])?));
        offset += align4(alen);
    }
    Ok(attrs)
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A decoded envelope: header fields plus the attribute list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: u16,
    pub flags: u16,
    pub sequence: u32,
    pub pid: u32,
    pub src: u32,
    pub dst: u32,
    pub attrs: Vec<(AttrKind, AttrValue)>,
}

impl Envelope {
    /// Build a transport envelope carrying one CDATA payload, the common
    /// case on the request path.
    pub fn transport(sequence: u32, pid: u32, dst: u32, cdata: Bytes) -> Self {
        Envelope {
            kind: ENV_TRANSPORT,
            flags: 0,
            sequence,
            pid,
            src: 0,
            dst,
            attrs: vec![(AttrKind::Cdata, AttrValue::Bytes(cdata))],
        }
    }

    /// First attribute of the given kind, if present.
    pub fn get_attr(&self, kind: AttrKind) -> Option<&AttrValue> {
        self.attrs.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }

    /// The opaque payload bytes, when the envelope carries any.
    pub fn cdata(&self) -> Option<&Bytes> {
        self.get_attr(AttrKind::Cdata).and_then(AttrValue::as_bytes)
    }

    /// Serialize; `length` is patched to the final size.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + 64);
        let header = EnvelopeHeader {
            length: U32le::new(0), // patched below
            kind: U16le::new(self.kind),
            flags: U16le::new(self.flags),
            sequence: U32le::new(self.sequence),
            pid: U32le::new(self.pid),
            src: U32le::new(self.src),
            dst: U32le::new(self.dst),
        };
        out.put_slice(header.as_bytes());
        encode_attrs(&self.attrs, &mut out);
        let total = out.len() as u32;
        out[0..4].copy_from_slice(&total.to_le_bytes());
        out.freeze()
    }

    /// Inverse of [`Envelope::encode`]. `data` must be exactly one envelope.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let header = EnvelopeHeader::read_from_prefix(data).ok_or(WireError::TruncatedHeader {
            need: ENVELOPE_HEADER_LEN,
            got: data.len(),
        })?;
        let declared = header.length.get();
        if declared as usize != data.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        Ok(Envelope {
            kind: header.kind.get(),
            flags: header.flags.get(),
            sequence: header.sequence.get(),
            pid: header.pid.get(),
            src: header.src.get(),
            dst: header.dst.get(),
            attrs: decode_attrs(&data[ENVELOPE_HEADER_LEN..])?,
        })
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated header: need {need} bytes, got {got}")]
    TruncatedHeader { need: usize, got: usize },

    #[error("envelope length {declared} disagrees with buffer size {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    #[error("impossible frame length {0}")]
    FramingError(u32),

    #[error("unknown attribute kind {0}")]
    UnknownAttribute(u16),

    #[error("attribute value does not fit kind {0:?}")]
    AttrValueMismatch(AttrKind),

    #[error("unknown control command {0}")]
    UnknownCommand(u16),
}

// ── Tests ────────────────────────────────────────────────────────────────────
