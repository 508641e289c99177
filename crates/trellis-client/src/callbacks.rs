//! Callback chain — synchronous message filters.
//!
//! Entries run on the reassembly task, in registration order, for every
//! parsed record before it is enqueued anywhere. That means callbacks see
//! broadcasts whether or not the broadcast queue is installed. Predicates
//! and actions must be cheap and must not block; heavy work belongs on a
//! worker task fed from an action.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use trellis_core::message::Message;

type Predicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;
type Action = Box<dyn Fn(&Message) + Send + Sync>;

/// Token identifying one registered callback. Closures are not comparable,
/// so removal goes by this token rather than by the action itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

struct Entry {
    id: u64,
    predicate: Predicate,
    action: Action,
}

/// Ordered (predicate, action) pairs.
#[derive(Default)]
pub struct CallbackChain {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl CallbackChain {
    pub fn new() -> Self {
        CallbackChain::default()
    }

    /// Append an entry; returns the token for later removal.
    pub fn register<P, A>(&self, predicate: P, action: A) -> CallbackId
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        A: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().unwrap().push(Entry {
            id,
            predicate: Box::new(predicate),
            action: Box::new(action),
        });
        CallbackId(id)
    }

    /// Remove the entry registered under `id`. Returns whether it existed.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.iter().position(|e| e.id == id.0) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Run the chain over one record. A panicking predicate or action is
    /// contained and logged; the remaining entries still run.
    pub fn run(&self, msg: &Message) {
        let entries = self.entries.read().unwrap();
        for entry in entries.iter() {
            let matched = catch_unwind(AssertUnwindSafe(|| (entry.predicate)(msg)));
            match matched {
                Ok(true) => {
                    if catch_unwind(AssertUnwindSafe(|| (entry.action)(msg))).is_err() {
                        tracing::warn!(callback = entry.id, "callback action panicked");
                    }
                }
                Ok(false) => {}
                Err(_) => {
                    tracing::warn!(callback = entry.id, "callback predicate panicked");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
