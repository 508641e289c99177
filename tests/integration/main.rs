//! Trellis integration harness.
//!
//! Tests drive the full client against an in-process transport double: a
//! scripted peer that takes the far bridge endpoint, acknowledges
//! management commands, and plays back canned reply records keyed by the
//! request's inner kind. No sockets, no kernel — the seam under test is
//! everything from the dispatcher down to the reassembly worker.

mod framing;
mod requests;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use trellis_client::{Client, Endpoint, Transport};
use trellis_core::config::ClientConfig;
use trellis_core::marshal::GenericMarshal;
use trellis_core::message::{Message, MSG_DONE, MSG_ERROR, MSG_F_MULTI};
use trellis_core::mgmt::{ControlCmd, ControlMessage};
use trellis_core::wire::{AttrKind, AttrValue, Envelope, ENV_CONTROL, ENV_F_CONTROL};

// ── Canned replies ────────────────────────────────────────────────────────────

/// One reply record the host plays back; sequence is patched per request.
#[derive(Clone)]
pub struct CannedReply {
    pub kind: u16,
    pub flags: u16,
    pub body: Bytes,
}

impl CannedReply {
    pub fn record(kind: u16, flags: u16, body: &'static [u8]) -> Self {
        CannedReply {
            kind,
            flags,
            body: Bytes::from_static(body),
        }
    }

    /// Multi-part terminator.
    pub fn done() -> Self {
        CannedReply {
            kind: MSG_DONE,
            flags: MSG_F_MULTI,
            body: Bytes::new(),
        }
    }

    /// Failure report carrying `code` (encoded negated, kernel style).
    pub fn failure(code: i32) -> Self {
        CannedReply {
            kind: MSG_ERROR,
            flags: 0,
            body: Bytes::copy_from_slice(&(-code).to_le_bytes()),
        }
    }
}

// ── Scripted transport host ───────────────────────────────────────────────────

struct HostState {
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    scripts: Mutex<HashMap<u16, Vec<CannedReply>>>,
    rejected: Mutex<HashSet<u16>>,
    fragment_at: AtomicUsize,
    coalesce: AtomicBool,
    next_realm: AtomicU32,
}

/// The transport double. Owns the far endpoint after `attach`, answers
/// management exchanges with ACKs (unless told to reject), and replies to
/// user requests from the script table.
#[derive(Clone)]
pub struct TestHost {
    inner: Arc<HostState>,
}

impl TestHost {
    pub fn new() -> TestHost {
        TestHost {
            inner: Arc::new(HostState {
                endpoint: Mutex::new(None),
                scripts: Mutex::new(HashMap::new()),
                rejected: Mutex::new(HashSet::new()),
                fragment_at: AtomicUsize::new(0),
                coalesce: AtomicBool::new(false),
                next_realm: AtomicU32::new(1),
            }),
        }
    }

    /// Play back `replies` for requests whose inner kind is `request_kind`.
    pub fn script(&self, request_kind: u16, replies: Vec<CannedReply>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(request_kind, replies);
    }

    /// Answer this management command with a non-ACK reply.
    pub fn reject(&self, cmd: ControlCmd) {
        self.inner.rejected.lock().unwrap().insert(cmd as u16);
    }

    /// Split every outgoing datagram at `n` bytes (0 = send whole).
    pub fn fragment_at(&self, n: usize) {
        self.inner.fragment_at.store(n, Ordering::Relaxed);
    }

    /// Pack all reply envelopes of one request into a single datagram.
    pub fn coalesce(&self, on: bool) {
        self.inner.coalesce.store(on, Ordering::Relaxed);
    }

    /// Emit one unsolicited record (sequence 0), as the kernel would.
    pub fn broadcast(&self, kind: u16, body: &[u8]) {
        let mut inner = Message::request(kind, 0, Bytes::copy_from_slice(body));
        inner.header_mut().flags = 0; // broadcasts are not requests
        let envelope = Envelope::transport(0, 0, 0, inner.encode()).encode();
        self.inner.transmit(&envelope);
    }
}

impl HostState {
    fn held(&self) -> Arc<Endpoint> {
        self.endpoint
            .lock()
            .unwrap()
            .clone()
            .expect("host endpoint not attached")
    }

    /// Send one datagram to the client, honoring the fragmentation knob.
    fn transmit(&self, data: &[u8]) {
        let endpoint = self.held();
        let split = self.fragment_at.load(Ordering::Relaxed);
        if split > 0 && data.len() > split {
            endpoint
                .send(Bytes::copy_from_slice(&data[..split]))
                .expect("host send");
            endpoint
                .send(Bytes::copy_from_slice(&data[split..]))
                .expect("host send");
        } else {
            endpoint
                .send(Bytes::copy_from_slice(data))
                .expect("host send");
        }
    }

    fn answer_control(&self, request: &Envelope) {
        let Some(cdata) = request.cdata() else { return };
        let Ok(record) = ControlMessage::decode(cdata) else {
            return;
        };
        let reply = if self.rejected.lock().unwrap().contains(&(record.cmd as u16)) {
            // Echo the command back instead of acknowledging.
            ControlMessage::new(record.cmd, vec![])
        } else {
            let attrs = match record.cmd {
                ControlCmd::Connect => vec![(
                    AttrKind::Addr,
                    AttrValue::U32(self.next_realm.fetch_add(1, Ordering::Relaxed)),
                )],
                ControlCmd::Subscribe => vec![(AttrKind::Cid, AttrValue::U32(7))],
                _ => vec![],
            };
            ControlMessage::new(ControlCmd::Ack, attrs)
        };
        let envelope = Envelope {
            kind: ENV_CONTROL,
            flags: ENV_F_CONTROL,
            sequence: request.sequence,
            pid: 0,
            src: request.dst,
            dst: 0,
            attrs: vec![(AttrKind::Cdata, AttrValue::Bytes(reply.encode()))],
        };
        self.transmit(&envelope.encode());
    }

    fn answer_request(&self, request: &Envelope) {
        let Some(cdata) = request.cdata() else { return };
        let Ok((inner, _)) = Message::decode_prefix(cdata) else {
            return;
        };
        let replies = self.scripts.lock().unwrap().get(&inner.kind()).cloned();
        let Some(replies) = replies else { return };

        let mut datagrams = Vec::new();
        for template in replies {
            let mut record = Message::request(template.kind, 0, template.body.clone());
            let header = record.header_mut();
            header.flags = template.flags;
            header.sequence = request.sequence;
            let envelope = Envelope::transport(request.sequence, 0, 0, record.encode());
            datagrams.push(envelope.encode());
        }

        if self.coalesce.load(Ordering::Relaxed) {
            let mut packed = Vec::new();
            for datagram in &datagrams {
                packed.extend_from_slice(datagram);
            }
            self.transmit(&packed);
        } else {
            for datagram in &datagrams {
                self.transmit(datagram);
            }
        }
    }

    async fn run(self: Arc<Self>, endpoint: Arc<Endpoint>) {
        while let Some(datagram) = endpoint.recv().await {
            let Ok(envelope) = Envelope::decode(&datagram) else {
                continue;
            };
            if envelope.kind == ENV_CONTROL {
                self.answer_control(&envelope);
            } else {
                self.answer_request(&envelope);
            }
        }
    }
}

impl Transport for TestHost {
    fn attach(&self, endpoint: Endpoint, _control: bool) -> anyhow::Result<()> {
        *self.inner.endpoint.lock().unwrap() = Some(Arc::new(endpoint));
        Ok(())
    }

    fn reload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        let endpoint = self.inner.held();
        tokio::spawn(self.inner.clone().run(endpoint));
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        if let Some(endpoint) = self.inner.endpoint.lock().unwrap().take() {
            tokio::spawn(async move { endpoint.close().await });
        }
        Ok(())
    }
}

// ── Setup helpers ─────────────────────────────────────────────────────────────

pub fn test_config() -> ClientConfig {
    ClientConfig {
        timeout_secs: 1,
        ..ClientConfig::default()
    }
}

/// Bring up a host/client pair with the default realm connected.
pub async fn connected(config: ClientConfig) -> (TestHost, Client) {
    let host = TestHost::new();
    let client = Client::new(
        config,
        Arc::new(host.clone()),
        Arc::new(GenericMarshal::new()),
    )
    .await
    .expect("client startup");
    (host, client)
}
