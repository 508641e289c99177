//! Management messages — the control-plane vocabulary exchanged with the
//! transport host.
//!
//! A management record travels in the same envelope as user traffic but
//! under the CONTROL kind with envelope flag 1, and is always terminal:
//! exactly one reply per request, never multi-part.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{decode_attrs, encode_attrs, AttrKind, AttrValue, WireError};

/// Recognized control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlCmd {
    Ack = 1,
    Serve = 2,
    Shutdown = 3,
    Connect = 4,
    Disconnect = 5,
    Subscribe = 6,
    Unsubscribe = 7,
}

impl TryFrom<u16> for ControlCmd {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            1 => Ok(ControlCmd::Ack),
            2 => Ok(ControlCmd::Serve),
            3 => Ok(ControlCmd::Shutdown),
            4 => Ok(ControlCmd::Connect),
            5 => Ok(ControlCmd::Disconnect),
            6 => Ok(ControlCmd::Subscribe),
            7 => Ok(ControlCmd::Unsubscribe),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// Body header: command + reserved pad, before the attribute list.
const CONTROL_HEADER_LEN: usize = 4;

/// One management record: a command plus its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub cmd: ControlCmd,
    pub attrs: Vec<(AttrKind, AttrValue)>,
}

impl ControlMessage {
    pub fn new(cmd: ControlCmd, attrs: Vec<(AttrKind, AttrValue)>) -> Self {
        ControlMessage { cmd, attrs }
    }

    /// First attribute of the given kind, if present.
    pub fn get_attr(&self, kind: AttrKind) -> Option<&AttrValue> {
        self.attrs.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(CONTROL_HEADER_LEN + 32);
        out.put_u16_le(self.cmd as u16);
        out.put_u16_le(0); // reserved
        encode_attrs(&self.attrs, &mut out);
        out.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < CONTROL_HEADER_LEN {
            return Err(WireError::TruncatedHeader {
                need: CONTROL_HEADER_LEN,
                got: data.len(),
            });
        }
        let cmd = ControlCmd::try_from(u16::from_le_bytes(data[0..2].try_into().unwrap()))?;
        Ok(ControlMessage {
            cmd,
            attrs: decode_attrs(&data[CONTROL_HEADER_LEN..])?,
        })
    }
}
