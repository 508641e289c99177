//! Reassembly worker — turns raw bridge blobs into routed records.
//!
//! Single consumer of the reader's blob channel. For every complete
//! envelope it recovers: management replies go straight to the requester's
//! queue; user payloads go through the marshal, then the callback chain,
//! then per-sequence delivery with broadcast fallback and optional
//! mirroring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use trellis_core::frame::{Reassembler, SHUTDOWN_SENTINEL};
use trellis_core::marshal::Marshal;
use trellis_core::mgmt::ControlMessage;
use trellis_core::wire::{Envelope, ENV_F_CONTROL};

use crate::callbacks::CallbackChain;
use crate::registry::{ListenerRegistry, Reply, BROADCAST_KEY};

pub(crate) struct ReassemblyWorker {
    pub(crate) blobs: mpsc::UnboundedReceiver<Bytes>,
    pub(crate) marshal: Arc<dyn Marshal>,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) callbacks: Arc<CallbackChain>,
    pub(crate) mirror: Arc<AtomicBool>,
}

impl ReassemblyWorker {
    pub(crate) async fn run(mut self) {
        let mut reassembler = Reassembler::new();
        while let Some(blob) = self.blobs.recv().await {
            if blob.as_ref() == SHUTDOWN_SENTINEL {
                tracing::debug!("reassembly worker got shutdown sentinel");
                break;
            }
            reassembler.extend(&blob);
            loop {
                match reassembler.next_frame() {
                    Some(Ok(frame)) => self.handle_frame(&frame),
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "framing error, stream resynced");
                    }
                    None => break,
                }
            }
        }
        tracing::debug!("reassembly worker stopped");
    }

    fn handle_frame(&self, frame: &Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    len = frame.len(),
                    prefix = hex::encode(&frame[..frame.len().min(16)]),
                    "bad envelope dropped"
                );
                return;
            }
        };
        let Some(cdata) = envelope.cdata() else {
            tracing::trace!(sequence = envelope.sequence, "envelope without payload dropped");
            return;
        };

        if envelope.flags & ENV_F_CONTROL != 0 {
            match ControlMessage::decode(cdata) {
                Ok(reply) => {
                    self.registry.deliver(envelope.sequence, Reply::Control(reply));
                }
                Err(err) => {
                    tracing::warn!(error = %err, sequence = envelope.sequence, "bad management reply dropped");
                }
            }
            return;
        }

        let records = match self.marshal.parse(cdata.clone()) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, sequence = envelope.sequence, "payload failed to parse, dropped");
                return;
            }
        };

        for mut msg in records {
            self.marshal.fix_message(&mut msg);
            // Callbacks observe every record, listeners or not.
            self.callbacks.run(&msg);

            let key = msg.sequence();
            let routed = if self.registry.contains(key) {
                key
            } else {
                BROADCAST_KEY
            };
            if self.mirror.load(Ordering::Relaxed) && routed != BROADCAST_KEY {
                self.registry.deliver(BROADCAST_KEY, Reply::User(msg.clone()));
            }
            self.registry.deliver(routed, Reply::User(msg));
        }
    }
}
