//! Control plane — management exchanges with the transport host.
//!
//! Every call here goes through one helper: a management record under the
//! CONTROL envelope kind with flag 1, answered by exactly one reply whose
//! command must be ACK. The reply rides the same listener machinery as
//! user traffic; the envelope flag tells the reassembly worker to decode
//! it as a control record instead of running the marshal.

use std::sync::atomic::Ordering;
use std::time::Duration;

use trellis_core::mgmt::{ControlCmd, ControlMessage};
use trellis_core::wire::{AttrKind, AttrValue, SubscriptionKey, ENV_CONTROL, ENV_F_CONTROL};

use crate::client::Client;
use crate::error::ClientError;
use crate::registry::{Reply, BROADCAST_KEY};

/// SSL credential strings forwarded to the transport host. Opaque here;
/// empty strings mean "none".
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub key: String,
    pub cert: String,
    pub ca: String,
}

impl Credentials {
    fn attrs(&self) -> Vec<(AttrKind, AttrValue)> {
        vec![
            (AttrKind::SslKey, AttrValue::Str(self.key.clone())),
            (AttrKind::SslCert, AttrValue::Str(self.cert.clone())),
            (AttrKind::SslCa, AttrValue::Str(self.ca.clone())),
        ]
    }
}

impl Client {
    /// One management exchange: send `cmd` with `attrs`, require an ACK,
    /// optionally extract one attribute from the reply.
    pub(crate) async fn command(
        &self,
        cmd: ControlCmd,
        attrs: Vec<(AttrKind, AttrValue)>,
        expect: Option<AttrKind>,
    ) -> Result<Option<AttrValue>, ClientError> {
        self.ensure_open()?;
        let sequence = self.shared.sequence.next();
        self.shared.registry.register(sequence, false)?;

        let outcome = match self.send_envelope(
            ENV_CONTROL,
            ENV_F_CONTROL,
            sequence,
            self.default_realm(),
            ControlMessage::new(cmd, attrs).encode(),
        ) {
            Ok(()) => self.get_control(sequence, self.shared.config.timeout()).await,
            Err(err) => Err(err),
        };
        self.shared.registry.remove(sequence).await;

        let reply = outcome?;
        if reply.cmd != ControlCmd::Ack {
            return Err(ClientError::ControlRejected { cmd: reply.cmd });
        }
        Ok(expect.and_then(|kind| reply.get_attr(kind).cloned()))
    }

    /// Pop the single management reply for `key`. Control exchanges are
    /// terminal: no multi-part collection.
    async fn get_control(
        &self,
        key: u32,
        timeout: Duration,
    ) -> Result<ControlMessage, ClientError> {
        let listener = self
            .shared
            .registry
            .get(key)
            .ok_or(ClientError::NoListener(key))?;
        let mut rx = listener.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_elapsed) => Err(ClientError::Timeout),
            Ok(item) => match item.flatten() {
                None => Err(ClientError::Drained),
                Some(Reply::Control(reply)) => Ok(reply),
                Some(Reply::User(_)) => Err(ClientError::UnexpectedReply),
            },
        }
    }

    /// Open a realm to `host` (the configured default host when `None`).
    /// The first successful connect seeds the default realm.
    pub async fn connect(
        &self,
        host: Option<&str>,
        creds: &Credentials,
    ) -> Result<u32, ClientError> {
        let host = host.unwrap_or(&self.shared.config.host).to_owned();
        let mut attrs = vec![(AttrKind::Host, AttrValue::Str(host))];
        attrs.extend(creds.attrs());
        let value = self
            .command(ControlCmd::Connect, attrs, Some(AttrKind::Addr))
            .await?;
        let realm = value
            .and_then(|v| v.as_u32())
            .ok_or(ClientError::UnexpectedReply)?;

        self.shared.realms.lock().unwrap().insert(realm);
        let _ = self.shared.default_realm.compare_exchange(
            0,
            realm,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(realm)
    }

    /// Close a realm and drop it from the set.
    pub async fn disconnect(&self, realm: u32) -> Result<(), ClientError> {
        self.command(
            ControlCmd::Disconnect,
            vec![(AttrKind::Addr, AttrValue::U32(realm))],
            None,
        )
        .await?;
        self.shared.realms.lock().unwrap().remove(&realm);
        Ok(())
    }

    /// Ask the transport host to serve on `url`.
    pub async fn serve(&self, url: &str, creds: &Credentials) -> Result<(), ClientError> {
        let mut attrs = vec![(AttrKind::Host, AttrValue::Str(url.to_owned()))];
        attrs.extend(creds.attrs());
        self.command(ControlCmd::Serve, attrs, None).await?;
        Ok(())
    }

    /// Ask the transport host to stop serving on `url`.
    pub async fn shutdown_url(&self, url: &str) -> Result<(), ClientError> {
        self.command(
            ControlCmd::Shutdown,
            vec![(AttrKind::Host, AttrValue::Str(url.to_owned()))],
            None,
        )
        .await?;
        Ok(())
    }

    /// Install or remove the broadcast queue at key 0.
    ///
    /// The kernel emits unsolicited messages all the time; none of them are
    /// queued until monitoring is on. With it on, they collect under key 0
    /// and can be drained with `get(0, ..)`.
    pub async fn monitor(&self, enable: bool) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut cid = self.shared.cid.lock().await;
        if enable {
            if cid.is_some() {
                return Ok(());
            }
            self.shared.registry.register(BROADCAST_KEY, true)?;
            let subscription = vec![(
                AttrKind::SubKey,
                AttrValue::SubKey(SubscriptionKey {
                    offset: 8,
                    key: 0,
                    mask: 0,
                }),
            )];
            let value = match self
                .command(ControlCmd::Subscribe, subscription, Some(AttrKind::Cid))
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    self.shared.registry.remove(BROADCAST_KEY).await;
                    return Err(err);
                }
            };
            *cid = Some(
                value
                    .and_then(|v| v.as_u32())
                    .ok_or(ClientError::UnexpectedReply)?,
            );
        } else {
            if let Some(channel) = cid.take() {
                self.command(
                    ControlCmd::Unsubscribe,
                    vec![(AttrKind::Cid, AttrValue::U32(channel))],
                    None,
                )
                .await?;
            }
            self.shared.registry.remove(BROADCAST_KEY).await;
        }
        Ok(())
    }

    /// Mirror mode: monitoring plus a copy of every routed record delivered
    /// into the broadcast queue.
    pub async fn mirror(&self, enable: bool) -> Result<(), ClientError> {
        self.monitor(enable).await?;
        self.shared.mirror.store(enable, Ordering::Relaxed);
        Ok(())
    }
}
