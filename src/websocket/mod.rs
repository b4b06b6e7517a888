//! Inbound WebSocket transport: upgrade, per-connection tasks, envelopes.

mod handler;
mod message;

pub use handler::{ws_handler, WsQuery};
pub use message::{ClientMessage, OutboundMessage, PresenceEntry, ServerMessage};
