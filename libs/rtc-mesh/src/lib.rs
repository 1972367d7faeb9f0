//! WebRTC peer connections carrying WireGuard traffic.
//!
//! One [`PeerConnection`] per remote device. The wrapper owns SDP
//! negotiation, trickled candidates, the unreliable `bamgate` data channel
//! and ICE restarts, and shields the agent from the quirks of the
//! underlying WebRTC stack. The agent receives notifications through the
//! [`PeerEvents`] trait — peers never hold a reference back into the agent.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod peer;
mod turn_bridge;

pub use peer::{PeerConnection, PeerRtcConfig, Role};
pub use turn_bridge::TurnWsBridge;

use std::fmt;

/// Label of the data channel that carries WireGuard datagrams.
pub const DATA_CHANNEL_LABEL: &str = "bamgate";

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    New,
    Offering,
    Answering,
    Connecting,
    Connected,
    Restarting,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Offering => "offering",
            PeerState::Answering => "answering",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Restarting => "restarting",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };

        f.write_str(s)
    }
}

/// How the selected ICE path reaches the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceType {
    Host,
    Srflx,
    Relay,
    #[default]
    Unknown,
}

impl fmt::Display for IceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceType::Host => "host",
            IceType::Srflx => "srflx",
            IceType::Relay => "relay",
            IceType::Unknown => "unknown",
        };

        f.write_str(s)
    }
}

/// An ICE server to hand to the peer connection.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Callbacks from a peer connection into its owner.
///
/// Implementations must be cheap and non-blocking; they are invoked from
/// the WebRTC stack's callback executor.
pub trait PeerEvents: Send + Sync + 'static {
    /// A local ICE candidate is ready to be trickled to the remote side.
    fn on_candidate(&self, peer_id: &str, candidate: String);

    /// The connection moved to a new state.
    fn on_state(&self, peer_id: &str, state: PeerState);

    /// The data channel opened or closed.
    fn on_data_channel(&self, peer_id: &str, open: bool);
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("webrtc failure: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("peer connection is closed")]
    Closed,
    #[error("no remote description yet")]
    NoRemoteDescription,
    #[error("TURN bridge failure: {0}")]
    Bridge(#[source] std::io::Error),
}
