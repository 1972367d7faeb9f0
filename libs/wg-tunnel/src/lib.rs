//! Userspace WireGuard over in-process datagram channels.
//!
//! Classic WireGuard sends its encrypted datagrams over a UDP socket. Here
//! the socket is replaced by an in-process shim: every remote peer is
//! assigned a synthetic UDP endpoint (`127.0.0.1:<port>`, unique within the
//! process) and datagrams for that endpoint are handed to whatever transport
//! the caller registered for the peer — in practice a WebRTC data channel.
//! A closed transport drops packets on the floor; WireGuard's own timers
//! handle retransmission, the tunnel is lossy by design.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod device;
mod endpoint;
mod keys;

pub use device::{OutboundReceiver, PeerConfig, WgTunnel, MAX_DATAGRAM_SIZE};
pub use endpoint::EndpointAllocator;
pub use keys::{parse_private_key, parse_public_key, public_key_base64};

use std::net::SocketAddr;

/// A datagram tagged with the synthetic endpoint it belongs to.
pub type TaggedDatagram = (SocketAddr, bytes::Bytes);

/// WireGuard's persistent keepalive towards every peer, in seconds.
pub const PERSISTENT_KEEPALIVE: u16 = 25;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer is not configured: {0}")]
    UnknownPeer(String),
    #[error("failed to construct WireGuard state: {0}")]
    Noise(&'static str),
    #[error("the device task is gone")]
    DeviceGone,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
