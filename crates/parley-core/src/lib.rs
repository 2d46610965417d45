//! parley-core: Shared protocol library for the parley chat relay.
//!
//! Provides the envelope and payload types exchanged over the WebSocket,
//! the JSON envelope codec, and the shared error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, decode_payload, encode};
pub use error::{ParleyError, ParleyResult};
pub use messages::{Envelope, ErrorReason, MsgKind};
