//! Signaling wire protocol and the agent-side WebSocket client.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod client;
mod proto;

pub use client::{Error, Event, SignalingChannel};
pub use proto::{Message, PeerInfo};
