//! The signaling hub: one room per network, JSON messages routed between
//! room members.
//!
//! The routing core ([`Rooms`]) is plain synchronous state so it can be
//! exercised without sockets; the WebSocket handler in `main.rs` feeds it
//! and forwards its outbound messages.

use signaling::{Message, PeerInfo};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Per-member outbound queue depth. Members that cannot drain this fast
/// are better off reconnecting.
pub const MEMBER_QUEUE_DEPTH: usize = 256;

pub struct Rooms {
    inner: Mutex<HashMap<String, Room>>,
}

#[derive(Default)]
struct Room {
    members: HashMap<String, Member>,
}

struct Member {
    info: PeerInfo,
    tx: mpsc::Sender<Message>,
    /// Increments on every attachment of the same device id; stale sockets
    /// learn they were replaced when their generation no longer matches.
    generation: u64,
}

/// Outcome of a join: what to tell the joiner and the rest of the room.
pub struct Joined {
    /// Snapshot of all *other* members, for the joiner.
    pub peer_list: Message,
    /// This socket's generation; used to detect replacement on cleanup.
    pub generation: u64,
}

impl Rooms {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a member to a room, replacing any previous attachment of the
    /// same device id (the old socket's queue is closed).
    ///
    /// Broadcasts `peer-joined` to everyone else and returns the
    /// `peer-list` snapshot for the joiner.
    pub fn join(
        &self,
        room_id: &str,
        info: PeerInfo,
        tx: mpsc::Sender<Message>,
    ) -> Joined {
        let mut rooms = self.inner.lock().expect("rooms lock never poisoned");
        let room = rooms.entry(room_id.to_owned()).or_default();

        let generation = room
            .members
            .remove(&info.id)
            .map(|old| {
                tracing::info!(room = %room_id, peer = %info.id, "replacing previous attachment");
                old.generation + 1
            })
            .unwrap_or(0);

        let snapshot: Vec<PeerInfo> = room
            .members
            .values()
            .map(|m| m.info.clone())
            .collect();

        room.broadcast(
            &info.id,
            Message::PeerJoined { peer: info.clone() },
        );

        room.members.insert(
            info.id.clone(),
            Member {
                info,
                tx,
                generation,
            },
        );

        Joined {
            peer_list: Message::PeerList { peers: snapshot },
            generation,
        }
    }

    /// Routes a peer-addressed message within the room.
    ///
    /// Unknown recipients produce an `error` reply for the sender.
    pub fn route(&self, room_id: &str, from: &str, message: Message) -> Result<(), Message> {
        let Some(to) = message.to().map(|t| t.to_owned()) else {
            return Err(error_message(
                "bad-message",
                "message is not routable (missing `to`)",
            ));
        };

        let rooms = self.inner.lock().expect("rooms lock never poisoned");

        let Some(room) = rooms.get(room_id) else {
            return Err(error_message("unknown-peer", "room is empty"));
        };

        let Some(member) = room.members.get(&to) else {
            tracing::debug!(room = %room_id, %to, "dropping message to unknown recipient");
            return Err(error_message(
                "unknown-peer",
                &format!("no such peer: {to}"),
            ));
        };

        // Stamp the sender so nobody can spoof a `from`.
        let message = restamp_from(message, from);

        if member.tx.try_send(message).is_err() {
            tracing::warn!(room = %room_id, %to, "recipient queue full, dropping message");
        }

        Ok(())
    }

    /// Removes a member and tells the room, unless the socket was already
    /// replaced by a newer attachment of the same device.
    pub fn leave(&self, room_id: &str, device_id: &str, generation: u64) {
        let mut rooms = self.inner.lock().expect("rooms lock never poisoned");

        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };

        let is_current = room
            .members
            .get(device_id)
            .is_some_and(|m| m.generation == generation);

        if !is_current {
            return;
        }

        let Some(member) = room.members.remove(device_id) else {
            return;
        };

        room.broadcast(
            device_id,
            Message::PeerLeft {
                peer: member.info,
            },
        );

        if room.members.is_empty() {
            rooms.remove(room_id);
        }
    }

    /// Forcibly detaches a device (e.g. after revocation); its socket sees
    /// a closed queue and hangs up.
    pub fn kick(&self, room_id: &str, device_id: &str) {
        let mut rooms = self.inner.lock().expect("rooms lock never poisoned");

        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };

        if let Some(member) = room.members.remove(device_id) {
            drop(member.tx);
            room.broadcast(
                device_id,
                Message::PeerLeft { peer: member.info },
            );
        }

        if room.members.is_empty() {
            rooms.remove(room_id);
        }
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.inner
            .lock()
            .expect("rooms lock never poisoned")
            .get(room_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }
}

impl Room {
    fn broadcast(&self, except: &str, message: Message) {
        for (id, member) in &self.members {
            if id == except {
                continue;
            }

            if member.tx.try_send(message.clone()).is_err() {
                tracing::warn!(peer = %id, "member queue full, dropping broadcast");
            }
        }
    }
}

pub fn error_message(code: &str, text: &str) -> Message {
    Message::Error {
        code: code.to_owned(),
        message: text.to_owned(),
    }
}

fn restamp_from(message: Message, sender: &str) -> Message {
    match message {
        Message::Offer { to, sdp, .. } => Message::Offer {
            to,
            from: sender.to_owned(),
            sdp,
        },
        Message::Answer { to, sdp, .. } => Message::Answer {
            to,
            from: sender.to_owned(),
            sdp,
        },
        Message::Candidate { to, candidate, .. } => Message::Candidate {
            to,
            from: sender.to_owned(),
            candidate,
        },
        Message::Bye { to, .. } => Message::Bye {
            to,
            from: sender.to_owned(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_owned(),
            public_key: format!("pk-{id}"),
            address: "10.0.0.1/24".to_owned(),
            routes: vec![],
            dns: vec![],
            dns_search: vec![],
        }
    }

    fn member() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(MEMBER_QUEUE_DEPTH)
    }

    #[test]
    fn joiner_gets_snapshot_of_existing_members() {
        let rooms = Rooms::new();
        let (tx_a, _rx_a) = member();
        let (tx_b, _rx_b) = member();

        rooms.join("net", info("a"), tx_a);
        let joined = rooms.join("net", info("b"), tx_b);

        match joined.peer_list {
            Message::PeerList { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].id, "a");
            }
            other => panic!("expected peer-list, got {other:?}"),
        }
    }

    #[test]
    fn join_broadcasts_peer_joined() {
        let rooms = Rooms::new();
        let (tx_a, mut rx_a) = member();
        let (tx_b, _rx_b) = member();

        rooms.join("net", info("a"), tx_a);
        rooms.join("net", info("b"), tx_b);

        match rx_a.try_recv().unwrap() {
            Message::PeerJoined { peer } => assert_eq!(peer.id, "b"),
            other => panic!("expected peer-joined, got {other:?}"),
        }
    }

    #[test]
    fn routes_offer_to_recipient_and_stamps_sender() {
        let rooms = Rooms::new();
        let (tx_a, _rx_a) = member();
        let (tx_b, mut rx_b) = member();

        rooms.join("net", info("a"), tx_a);
        rooms.join("net", info("b"), tx_b);

        rooms
            .route(
                "net",
                "a",
                Message::Offer {
                    to: "b".to_owned(),
                    from: "mallory".to_owned(),
                    sdp: "v=0".to_owned(),
                },
            )
            .unwrap();

        match rx_b.try_recv().unwrap() {
            Message::Offer { from, .. } => assert_eq!(from, "a"),
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[test]
    fn unknown_recipient_yields_error_reply() {
        let rooms = Rooms::new();
        let (tx_a, _rx_a) = member();

        rooms.join("net", info("a"), tx_a);

        let err = rooms
            .route(
                "net",
                "a",
                Message::Candidate {
                    to: "ghost".to_owned(),
                    from: "a".to_owned(),
                    candidate: "candidate:1".to_owned(),
                },
            )
            .unwrap_err();

        match err {
            Message::Error { code, .. } => assert_eq!(code, "unknown-peer"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn leave_broadcasts_peer_left() {
        let rooms = Rooms::new();
        let (tx_a, mut rx_a) = member();
        let (tx_b, _rx_b) = member();

        rooms.join("net", info("a"), tx_a);
        let joined_b = rooms.join("net", info("b"), tx_b);

        // Drain the join broadcast first.
        let _ = rx_a.try_recv();

        rooms.leave("net", "b", joined_b.generation);

        match rx_a.try_recv().unwrap() {
            Message::PeerLeft { peer } => assert_eq!(peer.id, "b"),
            other => panic!("expected peer-left, got {other:?}"),
        }
        assert_eq!(rooms.member_count("net"), 1);
    }

    #[test]
    fn duplicate_join_replaces_older_attachment() {
        let rooms = Rooms::new();
        let (tx_1, _rx_1) = member();
        let (tx_2, mut rx_2) = member();
        let (tx_b, _rx_b) = member();

        let first = rooms.join("net", info("a"), tx_1);
        let second = rooms.join("net", info("a"), tx_2);
        rooms.join("net", info("b"), tx_b);

        assert_eq!(rooms.member_count("net"), 2, "only one attachment per device");
        assert!(second.generation > first.generation);

        // The stale socket's leave must not evict the fresh attachment.
        rooms.leave("net", "a", first.generation);
        assert_eq!(rooms.member_count("net"), 2);

        // The fresh attachment still receives traffic.
        let _ = rx_2.try_recv(); // peer-joined b
        rooms
            .route(
                "net",
                "b",
                Message::Bye {
                    to: "a".to_owned(),
                    from: "b".to_owned(),
                },
            )
            .unwrap();
        assert!(matches!(rx_2.try_recv().unwrap(), Message::Bye { .. }));
    }
}
