//! Sequence number allocation.

use std::sync::atomic::{AtomicU32, Ordering};

/// Mints request correlators in `[1, u32::MAX]`, wrapping past the maximum
/// back to 1. Zero is reserved for broadcast traffic and is never handed
/// out. Lock-free; concurrent callers always receive distinct values.
///
/// No reuse guarantee beyond the wrap: with reply queues bounded at 4096
/// and short listener lifetimes, a collision across a full 2^32 cycle is
/// not a practical concern.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter::default()
    }

    pub fn next(&self) -> u32 {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = if current == u32::MAX { 1 } else { current + 1 };
            match self.last.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}
