//! Bridge — the datagram seam between this client and the transport core.
//!
//! `pair()` builds two cross-wired endpoints with datagram semantics: each
//! send is one atomic datagram, each recv returns exactly one. One side
//! stays with the client (the bridge), the other is handed to the external
//! transport via [`Transport::attach`].

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::ClientError;

/// One side of a bridge pair.
pub struct Endpoint {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Cloneable send-only handle feeding the peer endpoint's receive side.
/// Held by the supervisor to write the shutdown sentinel after the
/// transport side has been handed off.
#[derive(Clone)]
pub struct EndpointSender(mpsc::UnboundedSender<Bytes>);

impl EndpointSender {
    pub fn send(&self, datagram: Bytes) -> Result<(), ClientError> {
        self.0.send(datagram).map_err(|_| ClientError::Bridge)
    }
}

/// Build a connected endpoint pair.
pub fn pair() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Endpoint {
            tx: b_tx,
            rx: AsyncMutex::new(a_rx),
        },
        Endpoint {
            tx: a_tx,
            rx: AsyncMutex::new(b_rx),
        },
    )
}

impl Endpoint {
    /// Transmit one datagram to the peer.
    pub fn send(&self, datagram: Bytes) -> Result<(), ClientError> {
        self.tx.send(datagram).map_err(|_| ClientError::Bridge)
    }

    /// Receive one datagram. `None` once the peer side is gone or this
    /// endpoint was closed and drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// Handle for sending into this endpoint's peer — i.e. into whatever
    /// the other side of the pair receives.
    pub fn sender(&self) -> EndpointSender {
        EndpointSender(self.tx.clone())
    }

    /// Stop accepting datagrams. Already-queued ones stay readable.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}

/// The external I/O core.
///
/// The transport owns the far endpoint after [`Transport::attach`] and is
/// expected to move datagrams between it and the actual medium. `control`
/// marks the endpoint as a control channel in the transport's own
/// bookkeeping.
pub trait Transport: Send + Sync {
    fn attach(&self, endpoint: Endpoint, control: bool) -> anyhow::Result<()>;

    /// Re-examine attached endpoints after a membership change.
    fn reload(&self) -> anyhow::Result<()>;

    fn start(&self) -> anyhow::Result<()>;

    fn stop(&self) -> anyhow::Result<()>;
}
