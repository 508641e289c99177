//! Listener registry — per-sequence reply queues.
//!
//! One bounded queue per in-flight request, keyed by sequence number, plus
//! the broadcast queue at key 0 installed while monitoring is on. The
//! reassembly task is the only producer; it must never block, so delivery
//! is try-send and overflow drops the message, observably.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use trellis_core::message::Message;
use trellis_core::mgmt::ControlMessage;

use crate::error::ClientError;

/// Key of the broadcast queue.
pub const BROADCAST_KEY: u32 = 0;

/// What a listener queue carries: user records from the marshal, or
/// management records on a control exchange.
#[derive(Debug, Clone)]
pub enum Reply {
    User(Message),
    Control(ControlMessage),
}

/// Queue item. `None` is the drain sentinel pushed at teardown to unblock
/// waiters.
type QueueItem = Option<Reply>;

/// One reply queue and its bookkeeping.
pub struct Listener {
    tx: mpsc::Sender<QueueItem>,
    pub(crate) rx: AsyncMutex<mpsc::Receiver<QueueItem>>,
    persist: bool,
    dropped: AtomicU64,
}

impl Listener {
    /// Persistent listeners survive timeouts and normal drains.
    pub fn persist(&self) -> bool {
        self.persist
    }

    /// Messages dropped on the floor because this queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ok,
    /// Queue full; message dropped and counted.
    Dropped,
    /// Neither the key nor the broadcast queue exists.
    NoListener,
}

/// The shared key → queue table.
pub struct ListenerRegistry {
    listeners: DashMap<u32, Arc<Listener>>,
    capacity: usize,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        ListenerRegistry {
            listeners: DashMap::new(),
            capacity,
        }
    }

    /// Install a fresh queue under `key`.
    pub fn register(&self, key: u32, persist: bool) -> Result<(), ClientError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let listener = Arc::new(Listener {
            tx,
            rx: AsyncMutex::new(rx),
            persist,
            dropped: AtomicU64::new(0),
        });
        match self.listeners.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ClientError::DuplicateListener(key)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(listener);
                Ok(())
            }
        }
    }

    pub fn contains(&self, key: u32) -> bool {
        self.listeners.contains_key(&key)
    }

    pub fn get(&self, key: u32) -> Option<Arc<Listener>> {
        self.listeners.get(&key).map(|entry| entry.value().clone())
    }

    /// Non-blocking delivery. An absent key falls back to the broadcast
    /// queue; a full queue drops the message and records the drop.
    pub fn deliver(&self, key: u32, reply: Reply) -> Delivery {
        let target = if self.listeners.contains_key(&key) {
            key
        } else {
            BROADCAST_KEY
        };
        let Some(listener) = self.get(target) else {
            return Delivery::NoListener;
        };
        match listener.tx.try_send(Some(reply)) {
            Ok(()) => Delivery::Ok,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = listener.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(key = target, total_dropped = total, "reply queue full, message dropped");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoListener,
        }
    }

    /// Detach the queue under `key`. Remaining user records are re-routed
    /// to the broadcast queue when one is installed, otherwise discarded.
    /// A waiter still blocked on the queue is woken with the sentinel.
    pub async fn remove(&self, key: u32) {
        let Some((_, listener)) = self.listeners.remove(&key) else {
            return;
        };
        let _ = listener.tx.try_send(None);
        // A waiter still holding the receiver will consume the sentinel
        // itself; only drain when nobody is receiving.
        let lock_result = listener.rx.try_lock();
        if let Ok(mut rx) = lock_result {
            while let Ok(item) = rx.try_recv() {
                if key == BROADCAST_KEY {
                    continue;
                }
                if let Some(reply @ Reply::User(_)) = item {
                    self.deliver(BROADCAST_KEY, reply);
                }
            }
        }
    }

    /// Wake every waiter with the sentinel. Shutdown path.
    pub fn interrupt_all(&self) {
        for entry in self.listeners.iter() {
            let _ = entry.value().tx.try_send(None);
        }
    }

    /// Per-listener drop counts, for observability.
    pub fn drop_stats(&self) -> Vec<(u32, u64)> {
        self.listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().dropped()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
