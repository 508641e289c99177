//! Client-side error types.

use trellis_core::mgmt::ControlCmd;
use trellis_core::wire::WireError;

/// Errors surfaced to callers of the client API.
///
/// Queue overflow is deliberately absent: a full reply queue drops the
/// message and bumps the listener's drop counter, it never fails a call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No message for a pending sequence within the deadline.
    #[error("request timed out")]
    Timeout,

    /// The peer answered with a failure report carrying this code.
    #[error("request failed with code {0}")]
    RequestFailed(i32),

    /// A management exchange was answered with something other than ACK.
    #[error("control request rejected with {cmd:?}")]
    ControlRejected { cmd: ControlCmd },

    /// The listener was drained by shutdown or explicit teardown.
    #[error("reply queue drained")]
    Drained,

    /// Operation attempted after release().
    #[error("client released")]
    Shutdown,

    /// A listener already exists for this sequence number.
    #[error("listener already registered for sequence {0}")]
    DuplicateListener(u32),

    /// No listener registered under this key.
    #[error("no listener for key {0}")]
    NoListener(u32),

    /// A user record arrived on a control exchange (or vice versa).
    #[error("unexpected reply kind on this exchange")]
    UnexpectedReply,

    /// The bridge endpoint is closed.
    #[error("bridge endpoint closed")]
    Bridge,

    /// The transport collaborator failed.
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}
