//! The signaling wire protocol.
//!
//! JSON over WebSocket text frames; every message carries a `type` field.
//! The same envelope is used in both directions.

use serde::{Deserialize, Serialize};

/// Everything a peer advertises about itself when joining a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub public_key: String,
    /// The peer's tunnel address in CIDR notation, e.g. `10.0.0.2/24`.
    pub address: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// First message on every connection; announces this device to the room.
    #[serde(rename_all = "camelCase")]
    Join {
        peer_id: String,
        public_key: String,
        address: String,
        #[serde(default)]
        routes: Vec<String>,
        #[serde(default)]
        dns: Vec<String>,
        #[serde(default)]
        dns_search: Vec<String>,
    },
    /// Snapshot of all other members of the room.
    PeerList { peers: Vec<PeerInfo> },
    PeerJoined { peer: PeerInfo },
    PeerLeft { peer: PeerInfo },
    Offer {
        to: String,
        from: String,
        sdp: String,
    },
    Answer {
        to: String,
        from: String,
        sdp: String,
    },
    /// A single trickled ICE candidate (an SDP `a=candidate` fragment).
    Candidate {
        to: String,
        from: String,
        candidate: String,
    },
    /// Graceful per-peer teardown.
    Bye { to: String, from: String },
    Error { code: String, message: String },
}

impl Message {
    /// The remote peer this message is addressed to, for routed messages.
    pub fn to(&self) -> Option<&str> {
        match self {
            Message::Offer { to, .. }
            | Message::Answer { to, .. }
            | Message::Candidate { to, .. }
            | Message::Bye { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            Message::Offer { from, .. }
            | Message::Answer { from, .. }
            | Message::Candidate { from, .. }
            | Message::Bye { from, .. } => Some(from),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_format() {
        let msg = Message::Join {
            peer_id: "dev-1".to_owned(),
            public_key: "pk".to_owned(),
            address: "10.0.0.1/24".to_owned(),
            routes: vec!["192.168.10.0/24".to_owned()],
            dns: vec![],
            dns_search: vec![],
        };

        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "join");
        assert_eq!(json["peerId"], "dev-1");
        assert_eq!(json["publicKey"], "pk");
        assert_eq!(json["dnsSearch"], serde_json::json!([]));
    }

    #[test]
    fn candidate_round_trips() {
        let msg = Message::Candidate {
            to: "b".to_owned(),
            from: "a".to_owned(),
            candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host".to_owned(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(back, msg);
    }

    #[test]
    fn peer_list_without_optional_fields() {
        let json = r#"{
            "type": "peer-list",
            "peers": [{"id": "x", "publicKey": "pk", "address": "10.0.0.3/24"}]
        }"#;

        let msg: Message = serde_json::from_str(json).unwrap();

        match msg {
            Message::PeerList { peers } => {
                assert_eq!(peers.len(), 1);
                assert!(peers[0].routes.is_empty());
            }
            other => panic!("expected peer-list, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"type": "frobnicate"}"#).is_err());
    }
}
