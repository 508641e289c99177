//! Marshal — pluggable parsing of CDATA payloads into inner messages.
//!
//! The multiplexer holds exactly one marshal, configured per protocol
//! family. A payload may carry several records packed back to back; the
//! marshal splits them and lifts out the one piece of body content the
//! core reacts to: the error code of a failure report.

use bytes::Bytes;

use crate::message::{Message, MESSAGE_HEADER_LEN, MSG_DONE, MSG_ERROR};
use crate::wire::WireError;

/// Turns raw payload bytes into parsed records.
///
/// Implementations must be cheap: `parse` runs on the reassembly task, in
/// line with callback dispatch and queue delivery.
pub trait Marshal: Send + Sync {
    /// Split `data` into the records it carries, in wire order.
    fn parse(&self, data: Bytes) -> Result<Vec<Message>, WireError>;

    /// Post-process one parsed record. Default: no-op. Family-specific
    /// marshals use this to tag records with an event name.
    fn fix_message(&self, _msg: &mut Message) {}
}

/// Default marshal: header-only parsing, body left opaque.
#[derive(Debug, Default)]
pub struct GenericMarshal;

impl GenericMarshal {
    pub fn new() -> Self {
        GenericMarshal
    }
}

impl Marshal for GenericMarshal {
    fn parse(&self, data: Bytes) -> Result<Vec<Message>, WireError> {
        let mut msgs = Vec::new();
        let mut offset = 0;
        while offset + MESSAGE_HEADER_LEN <= data.len() {
            let rest = data.slice(offset..);
            let (mut msg, consumed) = Message::decode_prefix(&rest)?;
            if msg.kind() == MSG_ERROR && msg.body.len() >= 4 {
                // Failure reports carry a negated error code in the first
                // four body bytes; code 0 is a plain acknowledgement.
                let code = i32::from_le_bytes(msg.body[0..4].try_into().unwrap());
                if code != 0 {
                    msg.error = Some(code.unsigned_abs() as i32);
                }
            }
            msgs.push(msg);
            offset += consumed;
        }
        if offset < data.len() {
            tracing::trace!(
                trailing = data.len() - offset,
                "payload carried trailing bytes shorter than a header, skipped"
            );
        }
        Ok(msgs)
    }

    fn fix_message(&self, msg: &mut Message) {
        msg.event = match msg.kind() {
            MSG_DONE => Some("done"),
            MSG_ERROR => Some("error"),
            _ => None,
        };
    }
}
