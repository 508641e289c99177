//! trellis-core — wire format, inner messages, and protocol vocabulary.
//! The client runtime crate depends on this one.

pub mod config;
pub mod frame;
pub mod marshal;
pub mod message;
pub mod mgmt;
pub mod wire;

pub use config::ClientConfig;
pub use frame::{Reassembler, SHUTDOWN_SENTINEL};
pub use marshal::{GenericMarshal, Marshal};
pub use message::{Message, MessageHeader};
pub use mgmt::{ControlCmd, ControlMessage};
pub use wire::{AttrKind, AttrValue, Envelope, WireError};
