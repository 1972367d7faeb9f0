//! The bamgate cloud worker: device registry, signaling hub and
//! TURN-over-WebSocket relay.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod app;
pub mod hub;
pub mod registry;
pub mod turn;

pub use app::{app, AppState};
