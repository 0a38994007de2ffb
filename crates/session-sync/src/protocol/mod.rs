//! Wire protocol domain modules.
//!
//! This namespace groups the JSON message structures exchanged between the
//! client and the backend:
//! - [`constants`]: protocol version, message type tags, credential format.
//! - [`messages`]: typed client→server and server→client messages.
//! - [`codec`]: conversion between typed messages and wire JSON, including
//!   key-name normalization at the boundary.

pub mod codec;
pub mod constants;
pub mod messages;

pub use constants::MessageTypes;
pub use messages::{ClientMessage, Envelope, ServerMessage, SessionId, SessionSummary};
