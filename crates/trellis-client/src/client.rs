//! Client — the request/response multiplexer.
//!
//! Owns the bridge endpoint and two long-lived tasks: the bridge reader
//! (recv → blob channel) and the reassembly worker (blob channel → parsed,
//! routed records). Caller tasks drive the dispatcher: allocate a sequence,
//! register a listener, ship an envelope, collect the reply stream.
//!
//! All shared state travels by capability into the tasks that touch it;
//! there are no globals.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use trellis_core::config::ClientConfig;
use trellis_core::frame::SHUTDOWN_SENTINEL;
use trellis_core::marshal::Marshal;
use trellis_core::message::{Message, MSG_DONE, MSG_F_MULTI};
use trellis_core::wire::{AttrKind, AttrValue, Envelope, ENV_TRANSPORT};

use crate::bridge::{self, Endpoint, EndpointSender, Transport};
use crate::callbacks::{CallbackChain, CallbackId};
use crate::control::Credentials;
use crate::error::ClientError;
use crate::reassembly::ReassemblyWorker;
use crate::registry::{ListenerRegistry, Reply, BROADCAST_KEY};
use crate::sequence::SequenceCounter;

/// Per-request knobs for [`Client::request`].
///
/// `kind`/`flags` override the inner header when set; `env_flags` goes on
/// the envelope; `realm` defaults to the realm opened at startup; `raw`
/// returns failure reports as records instead of raising them.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub kind: Option<u16>,
    pub flags: Option<u16>,
    pub env_flags: u16,
    pub realm: Option<u32>,
    pub timeout: Option<Duration>,
    pub raw: bool,
}

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) callbacks: Arc<CallbackChain>,
    pub(crate) sequence: SequenceCounter,
    pub(crate) realms: StdMutex<HashSet<u32>>,
    pub(crate) default_realm: AtomicU32,
    pub(crate) cid: AsyncMutex<Option<u32>>,
    pub(crate) mirror: Arc<AtomicBool>,
    pub(crate) closed: AtomicBool,
    pub(crate) endpoint: Arc<Endpoint>,
}

struct IoTasks {
    reader: JoinHandle<()>,
    parser: JoinHandle<()>,
    /// Writes into our own receive side, kept to deliver the shutdown
    /// sentinel after the far endpoint went to the transport.
    sentinel: EndpointSender,
    blob_tx: mpsc::UnboundedSender<Bytes>,
}

/// The multiplexing client. One per protocol family connection.
pub struct Client {
    pub(crate) shared: Arc<Shared>,
    tasks: AsyncMutex<Option<IoTasks>>,
}

async fn reader_loop(endpoint: Arc<Endpoint>, blobs: mpsc::UnboundedSender<Bytes>) {
    while let Some(blob) = endpoint.recv().await {
        let stop = blob.as_ref() == SHUTDOWN_SENTINEL;
        if blobs.send(blob).is_err() {
            break;
        }
        if stop {
            tracing::debug!("bridge reader got shutdown sentinel");
            break;
        }
    }
    tracing::debug!("bridge reader stopped");
}

impl Client {
    /// Bring up the I/O supervisor: build the bridge pair, hand the far
    /// side to the transport as a control channel, start reader and
    /// reassembly tasks, and (per config) open the default realm.
    pub async fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        marshal: Arc<dyn Marshal>,
    ) -> Result<Self, ClientError> {
        let (bridge, far) = bridge::pair();
        let sentinel = far.sender();
        transport.attach(far, true).map_err(ClientError::Transport)?;
        transport.reload().map_err(ClientError::Transport)?;
        transport.start().map_err(ClientError::Transport)?;

        let endpoint = Arc::new(bridge);
        let registry = Arc::new(ListenerRegistry::new(config.queue_capacity));
        let callbacks = Arc::new(CallbackChain::new());
        let mirror = Arc::new(AtomicBool::new(false));
        let (blob_tx, blob_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(reader_loop(endpoint.clone(), blob_tx.clone()));
        let parser = tokio::spawn(
            ReassemblyWorker {
                blobs: blob_rx,
                marshal,
                registry: registry.clone(),
                callbacks: callbacks.clone(),
                mirror: mirror.clone(),
            }
            .run(),
        );

        let client = Client {
            shared: Arc::new(Shared {
                config,
                transport,
                registry,
                callbacks,
                sequence: SequenceCounter::new(),
                realms: StdMutex::new(HashSet::new()),
                default_realm: AtomicU32::new(0),
                cid: AsyncMutex::new(None),
                mirror,
                closed: AtomicBool::new(false),
                endpoint,
            }),
            tasks: AsyncMutex::new(Some(IoTasks {
                reader,
                parser,
                sentinel,
                blob_tx,
            })),
        };

        if client.shared.config.do_connect {
            let realm = client.connect(None, &Credentials::default()).await?;
            tracing::info!(realm, "default realm opened");
        }
        Ok(client)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(ClientError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Realm used when a request does not name one.
    pub fn default_realm(&self) -> u32 {
        self.shared.default_realm.load(Ordering::Relaxed)
    }

    /// Realms currently connected.
    pub fn realms(&self) -> Vec<u32> {
        self.shared.realms.lock().unwrap().iter().copied().collect()
    }

    pub(crate) fn send_envelope(
        &self,
        kind: u16,
        flags: u16,
        sequence: u32,
        realm: u32,
        cdata: Bytes,
    ) -> Result<(), ClientError> {
        let envelope = Envelope {
            kind,
            flags,
            sequence,
            pid: std::process::id(),
            src: 0,
            dst: realm,
            attrs: vec![(AttrKind::Cdata, AttrValue::Bytes(cdata))],
        };
        self.shared.endpoint.send(envelope.encode())
    }

    /// Fire-and-forget: finalize the inner header, wrap, transmit. No
    /// listener is registered and no reply is awaited.
    pub fn push(
        &self,
        msg: &mut Message,
        options: &RequestOptions,
        sequence: u32,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let realm = options.realm.unwrap_or_else(|| self.default_realm());
        let header = msg.header_mut();
        header.sequence = sequence;
        header.pid = std::process::id();
        if let Some(kind) = options.kind {
            header.kind = kind;
        }
        if let Some(flags) = options.flags {
            header.flags = flags;
        }
        let inner = msg.encode();
        self.send_envelope(ENV_TRANSPORT, options.env_flags, sequence, realm, inner)
    }

    /// Send a request and collect its reply stream.
    ///
    /// Returned records are reset for re-encoding; transport headers are
    /// stripped unless the client runs in debug mode.
    pub async fn request(
        &self,
        mut msg: Message,
        options: RequestOptions,
    ) -> Result<Vec<Message>, ClientError> {
        self.ensure_open()?;
        let sequence = self.shared.sequence.next();
        self.shared.registry.register(sequence, false)?;

        let outcome = match self.push(&mut msg, &options, sequence) {
            Ok(()) => self.get(sequence, options.raw, options.timeout).await,
            Err(err) => {
                self.shared.registry.remove(sequence).await;
                Err(err)
            }
        };

        let mut replies = outcome?;
        for reply in &mut replies {
            reply.reset();
            if !self.shared.config.debug {
                reply.strip_header();
            }
        }
        Ok(replies)
    }

    /// Collect messages from the queue under `key` per the multi-part
    /// protocol: accumulate while the MULTI flag is set, stop at DONE.
    ///
    /// Key 0 and persistent listeners ride out timeouts; everything else
    /// is detached on timeout, drain, or failure. With `raw`, failure
    /// reports come back as records and collection stops after the first
    /// message.
    pub async fn get(
        &self,
        key: u32,
        raw: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<Message>, ClientError> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or_else(|| self.shared.config.timeout());
        let listener = self
            .shared
            .registry
            .get(key)
            .ok_or(ClientError::NoListener(key))?;

        let mut result = Vec::new();
        let mut rx = listener.rx.lock().await;
        loop {
            let item = match tokio::time::timeout(timeout, rx.recv()).await {
                Err(_elapsed) => {
                    if key == BROADCAST_KEY || listener.persist() {
                        if self.shared.closed.load(Ordering::SeqCst) {
                            return Err(ClientError::Shutdown);
                        }
                        continue;
                    }
                    drop(rx);
                    self.shared.registry.remove(key).await;
                    return Err(ClientError::Timeout);
                }
                Ok(item) => item.flatten(),
            };
            let msg = match item {
                None => {
                    drop(rx);
                    self.shared.registry.remove(key).await;
                    return Err(ClientError::Drained);
                }
                Some(Reply::Control(_)) => {
                    tracing::warn!(key, "management reply on a user exchange, skipped");
                    continue;
                }
                Some(Reply::User(msg)) => msg,
            };

            if let Some(code) = msg.error {
                if !raw {
                    drop(rx);
                    self.shared.registry.remove(key).await;
                    return Err(ClientError::RequestFailed(code));
                }
            }
            let kind = msg.kind();
            let flags = msg.flags();
            if kind != MSG_DONE || raw {
                result.push(msg);
            }
            if kind == MSG_DONE || flags & MSG_F_MULTI == 0 || raw {
                break;
            }
        }
        drop(rx);

        if key != BROADCAST_KEY && !listener.persist() {
            self.shared.registry.remove(key).await;
        }
        Ok(result)
    }

    /// Register a callback invoked for every parsed record.
    pub fn register_callback<A>(&self, action: A) -> CallbackId
    where
        A: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.callbacks.register(|_| true, action)
    }

    /// Register a callback gated by a predicate.
    pub fn register_filtered_callback<P, A>(&self, predicate: P, action: A) -> CallbackId
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        A: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.callbacks.register(predicate, action)
    }

    /// Remove a callback by its registration token.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.shared.callbacks.unregister(id)
    }

    /// Per-listener counts of messages dropped on queue overflow.
    pub fn drop_stats(&self) -> Vec<(u32, u64)> {
        self.shared.registry.drop_stats()
    }

    /// Shut down: disconnect all realms, stop the transport, unblock and
    /// join both tasks, close endpoints, wake every waiter. Idempotent.
    pub async fn release(&self) -> Result<(), ClientError> {
        let mut guard = self.tasks.lock().await;
        let Some(tasks) = guard.take() else {
            return Ok(());
        };

        for realm in self.realms() {
            if let Err(err) = self.disconnect(realm).await {
                tracing::warn!(realm, error = %err, "disconnect failed during release");
            }
        }
        if let Err(err) = self.shared.transport.stop() {
            tracing::warn!(error = %err, "transport stop failed");
        }

        self.shared.closed.store(true, Ordering::SeqCst);

        // Unblock the reader the way the transport side would: one sentinel
        // datagram into our receive side.
        let _ = tasks.sentinel.send(Bytes::copy_from_slice(&SHUTDOWN_SENTINEL));
        if tasks.reader.await.is_err() {
            tracing::warn!("bridge reader join failed");
        }

        self.shared.endpoint.close().await;

        // Terminator for the blob channel, in case the sentinel never made
        // it through the reader.
        drop(tasks.blob_tx);
        if tasks.parser.await.is_err() {
            tracing::warn!("reassembly worker join failed");
        }

        self.shared.registry.interrupt_all();
        tracing::info!("client released");
        Ok(())
    }
}
