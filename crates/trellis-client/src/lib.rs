//! trellis-client — asynchronous request/response multiplexer for the
//! trellis control protocol.
//!
//! The client encodes typed records into envelopes, correlates replies by
//! per-request sequence numbers, reassembles fragmented inbound traffic,
//! and demultiplexes parsed records into per-request queues, a broadcast
//! queue, and a synchronous callback chain.

pub mod bridge;
pub mod callbacks;
pub mod client;
pub mod control;
pub mod error;
mod reassembly;
pub mod registry;
pub mod sequence;

pub use bridge::{pair, Endpoint, EndpointSender, Transport};
pub use callbacks::{CallbackChain, CallbackId};
pub use client::{Client, RequestOptions};
pub use control::Credentials;
pub use error::ClientError;
pub use registry::{ListenerRegistry, Reply, BROADCAST_KEY};
pub use sequence::SequenceCounter;
