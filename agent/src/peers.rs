//! The agent's peer table.
//!
//! The table is owned by the event loop (single writer); everything here is
//! synchronous bookkeeping. Connection attempts, backoff and the
//! offerer/answerer tie-break live here so they can be tested without any
//! networking.

use rtc_mesh::{IceType, PeerConnection, PeerState, Role};
use signaling::PeerInfo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reconnection backoff: 1 s doubling to 60 s, with jitter.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_JITTER: f64 = 0.1;

/// A second ICE failure within this window triggers full renegotiation
/// instead of another ICE restart.
pub const RENEGOTIATE_WINDOW: Duration = Duration::from_secs(60);

pub struct PeerEntry {
    pub info: PeerInfo,
    pub state: PeerState,
    pub ice_type: IceType,
    pub data_channel_open: bool,
    /// Unix timestamp of the moment the data channel last opened.
    pub connected_since: Option<u64>,

    pub conn: Option<Arc<PeerConnection>>,
    /// Synthetic endpoint WireGuard routes this peer by.
    pub endpoint: Option<SocketAddr>,

    /// When the supervisor should next try to connect this peer.
    pub next_attempt: Option<Instant>,
    backoff: Duration,

    pub last_ice_failure: Option<Instant>,
}

impl PeerEntry {
    fn discovered(info: PeerInfo, now: Instant) -> Self {
        Self {
            info,
            state: PeerState::New,
            ice_type: IceType::Unknown,
            data_channel_open: false,
            connected_since: None,
            conn: None,
            endpoint: None,
            // Fresh peers connect immediately.
            next_attempt: Some(now),
            backoff: BACKOFF_INITIAL,
            last_ice_failure: None,
        }
    }

    /// Schedules the next connection attempt with exponential backoff.
    pub fn arm_retry(&mut self, now: Instant) {
        let jitter = 1.0 + BACKOFF_JITTER * (rand::random::<f64>() * 2.0 - 1.0);
        let delay = self.backoff.mul_f64(jitter);

        self.next_attempt = Some(now + delay);
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
    }

    /// A successful connection resets the backoff.
    pub fn mark_connected(&mut self) {
        self.backoff = BACKOFF_INITIAL;
        self.next_attempt = None;
        self.last_ice_failure = None;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt.is_some_and(|at| at <= now)
    }

    /// Whether a fresh ICE failure should renegotiate from scratch rather
    /// than restart ICE, and records the failure.
    pub fn record_ice_failure(&mut self, now: Instant) -> bool {
        let renegotiate = self
            .last_ice_failure
            .is_some_and(|previous| now.duration_since(previous) < RENEGOTIATE_WINDOW);

        self.last_ice_failure = Some(now);

        renegotiate
    }
}

/// What peer-list reconciliation decided to do.
#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Never seen before: add as discovered.
    Add(PeerInfo),
    /// Gone from the snapshot: tear down and remove.
    Remove(String),
    /// Same id but changed public key or tunnel address: tear down and
    /// re-add as a new peer.
    Replace(PeerInfo),
}

pub struct PeerTable {
    my_id: String,
    peers: HashMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn new(my_id: String) -> Self {
        Self {
            my_id,
            peers: HashMap::new(),
        }
    }

    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerEntry)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut PeerEntry)> {
        self.peers.iter_mut()
    }

    pub fn insert_discovered(&mut self, info: PeerInfo, now: Instant) {
        self.peers
            .insert(info.id.clone(), PeerEntry::discovered(info, now));
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerEntry> {
        self.peers.remove(peer_id)
    }

    /// The smaller device id initiates the offer.
    pub fn role_for(&self, peer_id: &str) -> Role {
        if self.my_id.as_str() < peer_id {
            Role::Offerer
        } else {
            Role::Answerer
        }
    }

    /// Diffs the table against a fresh `peer-list` snapshot.
    ///
    /// All actions derived from one snapshot are applied before the next
    /// one is processed; the caller executes them in order.
    pub fn reconcile(&self, snapshot: &[PeerInfo]) -> Vec<ReconcileAction> {
        let mut actions = Vec::new();

        for info in snapshot {
            if info.id == self.my_id {
                continue;
            }

            match self.peers.get(&info.id) {
                None => actions.push(ReconcileAction::Add(info.clone())),
                Some(entry)
                    if entry.info.public_key != info.public_key
                        || entry.info.address != info.address =>
                {
                    actions.push(ReconcileAction::Replace(info.clone()));
                }
                Some(_) => {}
            }
        }

        for id in self.peers.keys() {
            if !snapshot.iter().any(|info| &info.id == id) {
                actions.push(ReconcileAction::Remove(id.clone()));
            }
        }

        actions
    }

    /// Peers whose connection attempt is due.
    pub fn due_peers(&self, now: Instant) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.is_due(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_owned(),
            public_key: format!("pk-{id}"),
            address: "100.64.0.9/24".to_owned(),
            routes: vec![],
            dns: vec![],
            dns_search: vec![],
        }
    }

    #[test]
    fn smaller_id_offers() {
        let table = PeerTable::new("aaa".to_owned());

        assert_eq!(table.role_for("bbb"), Role::Offerer);
        assert_eq!(table.role_for("Zaa"), Role::Answerer); // 'Z' < 'a'
    }

    #[test]
    fn reconcile_adds_unknown_peers() {
        let table = PeerTable::new("me".to_owned());

        let actions = table.reconcile(&[info("a"), info("me")]);

        assert_eq!(actions, vec![ReconcileAction::Add(info("a"))]);
    }

    #[test]
    fn reconcile_removes_missing_peers() {
        let mut table = PeerTable::new("me".to_owned());
        table.insert_discovered(info("a"), Instant::now());

        let actions = table.reconcile(&[]);

        assert_eq!(actions, vec![ReconcileAction::Remove("a".to_owned())]);
    }

    #[test]
    fn reconcile_replaces_on_key_change() {
        let mut table = PeerTable::new("me".to_owned());
        table.insert_discovered(info("a"), Instant::now());

        let mut changed = info("a");
        changed.public_key = "rotated".to_owned();

        let actions = table.reconcile(&[changed.clone()]);

        assert_eq!(actions, vec![ReconcileAction::Replace(changed)]);
    }

    #[test]
    fn reconcile_converges_to_snapshot() {
        let mut table = PeerTable::new("me".to_owned());
        let now = Instant::now();
        table.insert_discovered(info("a"), now);
        table.insert_discovered(info("b"), now);

        let snapshot = vec![info("b"), info("c")];
        for action in table.reconcile(&snapshot) {
            match action {
                ReconcileAction::Add(info) | ReconcileAction::Replace(info) => {
                    table.insert_discovered(info, now)
                }
                ReconcileAction::Remove(id) => {
                    table.remove(&id);
                }
            }
        }

        let mut ids: Vec<_> = table.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut entry = PeerEntry::discovered(info("a"), Instant::now());
        let now = Instant::now();

        let mut delays = Vec::new();
        for _ in 0..10 {
            entry.arm_retry(now);
            delays.push(entry.next_attempt.unwrap() - now);
        }

        // Within jitter bounds: first ~1s, later ones capped at ~60s.
        assert!(delays[0] <= Duration::from_millis(1150));
        assert!(delays[9] >= Duration::from_secs(54));
        assert!(delays[9] <= Duration::from_secs(66));
    }

    #[test]
    fn second_failure_inside_window_renegotiates() {
        let mut entry = PeerEntry::discovered(info("a"), Instant::now());
        let now = Instant::now();

        assert!(!entry.record_ice_failure(now));
        assert!(entry.record_ice_failure(now + Duration::from_secs(30)));
        assert!(!entry.record_ice_failure(now + Duration::from_secs(300)));
    }
}
