//! The agent's main loop.
//!
//! One task owns the peer table, the WireGuard device handle, kernel
//! routes and DNS. Signaling messages, peer-connection callbacks, control
//! requests and the supervisor tick all funnel into a single `select!`, so
//! peer state transitions are naturally serialized.

use crate::config::{parse_cidr, PeerSelections, ValidConfig};
use crate::control::{
    ControlRequest, OfferingsResponse, PeerOffering, PeerRow, StatusResponse,
};
use crate::dns::DnsManager;
use crate::peers::{PeerTable, ReconcileAction};
use crate::routes::RouteManager;
use anyhow::{Context, Result};
use bamgate_relay::auth::make_credentials;
use futures::future;
use ip_network::Ipv4Network;
use rtc_mesh::{
    IceServer, PeerConnection, PeerEvents, PeerRtcConfig, PeerState, Role, TurnWsBridge,
};
use secrecy::SecretString;
use signaling::{Message, PeerInfo, SignalingChannel};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use wg_tunnel::WgTunnel;

/// Peer connections get this long to close during shutdown.
const PEER_CLOSE_DEADLINE: Duration = Duration::from_secs(5);

/// Validity of the TURN REST credentials we mint for ourselves.
const TURN_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

/// Callbacks from peer connections, serialized into the main loop.
#[derive(Debug)]
pub enum PeerEvent {
    Candidate { peer_id: String, candidate: String },
    State { peer_id: String, state: PeerState },
    DataChannel { peer_id: String, open: bool },
}

/// The [`PeerEvents`] implementation handed to every peer connection:
/// a one-way bridge into the agent, never an owning reference back.
pub struct EventBridge {
    tx: mpsc::Sender<PeerEvent>,
}

impl EventBridge {
    pub fn new(tx: mpsc::Sender<PeerEvent>) -> Self {
        Self { tx }
    }
}

impl PeerEvents for EventBridge {
    fn on_candidate(&self, peer_id: &str, candidate: String) {
        let _ = self.tx.try_send(PeerEvent::Candidate {
            peer_id: peer_id.to_owned(),
            candidate,
        });
    }

    fn on_state(&self, peer_id: &str, state: PeerState) {
        let _ = self.tx.try_send(PeerEvent::State {
            peer_id: peer_id.to_owned(),
            state,
        });
    }

    fn on_data_channel(&self, peer_id: &str, open: bool) {
        let _ = self.tx.try_send(PeerEvent::DataChannel {
            peer_id: peer_id.to_owned(),
            open,
        });
    }
}

pub struct Agent {
    config: ValidConfig,
    config_path: PathBuf,
    selections: BTreeMap<String, PeerSelections>,
    started_at: Instant,

    signaling: SignalingChannel,
    wg: WgTunnel,
    routes: RouteManager,
    dns: DnsManager,
    peers: PeerTable,
    turn_bridge: TurnWsBridge,
    turn_secret: SecretString,

    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    control_rx: mpsc::Receiver<ControlRequest>,
    access_token: watch::Receiver<SecretString>,

    cancel: CancellationToken,

    /// Whether the single 401 retry has been used up.
    auth_retry_used: bool,
}

impl Agent {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        config: ValidConfig,
        config_path: PathBuf,
        signaling: SignalingChannel,
        wg: WgTunnel,
        routes: RouteManager,
        dns: DnsManager,
        turn_bridge: TurnWsBridge,
        turn_secret: SecretString,
        control_rx: mpsc::Receiver<ControlRequest>,
        access_token: watch::Receiver<SecretString>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);

        Self {
            selections: config.peer_selections.clone(),
            peers: PeerTable::new(config.device_id.clone()),
            config,
            config_path,
            started_at: Instant::now(),
            signaling,
            wg,
            routes,
            dns,
            turn_bridge,
            turn_secret,
            events_tx,
            events_rx,
            control_rx,
            access_token,
            cancel,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.signaling.connect();

        let mut supervisor = tokio::time::interval(Duration::from_secs(1));
        let cancel = self.cancel.clone();

        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                event = future::poll_fn(|cx| self.signaling.poll(cx)) => {
                    match event {
                        Ok(event) => self.handle_signaling_event(event).await,
                        Err(signaling::Error::Unauthorized) => {
                            if self.auth_retry_used {
                                break Err(anyhow::anyhow!(
                                    "hub rejected our token twice; giving up"
                                ));
                            }

                            self.auth_retry_used = true;
                            tracing::warn!("hub rejected our token, retrying with the current one");

                            self.signaling.set_token(self.access_token.borrow().clone());
                            self.signaling.connect();
                        }
                        Err(signaling::Error::Fatal(e)) => break Err(e),
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_peer_event(event).await,
                Some(request) = self.control_rx.recv() => self.handle_control(request).await,
                result = self.access_token.changed() => {
                    if result.is_ok() {
                        // New token for future reconnects; existing sockets
                        // stay up.
                        self.signaling.set_token(self.access_token.borrow().clone());
                        self.auth_retry_used = false;
                    }
                }
                _ = supervisor.tick() => self.supervise().await,
            }
        };

        self.shutdown().await;

        result
    }

    // === signaling ========================================================

    async fn handle_signaling_event(&mut self, event: signaling::Event) {
        match event {
            signaling::Event::Connected => {
                tracing::info!("signaling link up");
            }
            signaling::Event::Hiccup { backoff, error } => {
                // Existing data channels keep running; only negotiation of
                // new peers is paused.
                tracing::warn!("signaling hiccup, retrying in {backoff:?}: {error:#}");
            }
            signaling::Event::Closed => {}
            signaling::Event::Inbound(message) => self.handle_signaling_message(message).await,
        }
    }

    async fn handle_signaling_message(&mut self, message: Message) {
        match message {
            Message::PeerList { peers } => self.reconcile_peer_list(peers).await,
            Message::PeerJoined { peer } => {
                // A single join is reconciliation against a one-peer delta.
                let known_unchanged = self
                    .peers
                    .get(&peer.id)
                    .is_some_and(|entry| {
                        entry.info.public_key == peer.public_key
                            && entry.info.address == peer.address
                    });

                if known_unchanged {
                    return;
                }

                if self.peers.get(&peer.id).is_some() {
                    self.teardown_peer(&peer.id, true).await;
                }

                tracing::info!(peer = %peer.id, "discovered peer");
                self.peers.insert_discovered(peer, Instant::now());
            }
            Message::PeerLeft { peer } => {
                tracing::info!(peer = %peer.id, "peer left");
                self.teardown_peer(&peer.id, true).await;
            }
            Message::Offer { from, sdp, .. } => self.handle_offer(&from, sdp).await,
            Message::Answer { from, sdp, .. } => self.handle_answer(&from, sdp).await,
            Message::Candidate {
                from, candidate, ..
            } => self.handle_candidate(&from, candidate).await,
            Message::Bye { from, .. } => {
                tracing::info!(peer = %from, "peer said goodbye");
                self.teardown_peer(&from, false).await;

                if let Some(entry) = self.peers.get_mut(&from) {
                    entry.state = PeerState::New;
                    entry.arm_retry(Instant::now());
                }
            }
            Message::Error { code, message } => {
                tracing::debug!(%code, %message, "hub error");
            }
            Message::Join { .. } => {
                tracing::debug!("ignoring join echoed to a client");
            }
        }
    }

    /// Applies a full `peer-list` snapshot atomically: every add/remove
    /// derived from this snapshot is done before the next message is
    /// processed.
    async fn reconcile_peer_list(&mut self, snapshot: Vec<PeerInfo>) {
        for action in self.peers.reconcile(&snapshot) {
            match action {
                ReconcileAction::Add(info) => {
                    tracing::info!(peer = %info.id, "discovered peer");
                    self.peers.insert_discovered(info, Instant::now());
                }
                ReconcileAction::Remove(id) => {
                    tracing::info!(peer = %id, "peer gone");
                    self.teardown_peer(&id, true).await;
                }
                ReconcileAction::Replace(info) => {
                    tracing::info!(peer = %info.id, "peer identity changed, renegotiating");
                    self.teardown_peer(&info.id, true).await;
                    self.peers.insert_discovered(info, Instant::now());
                }
            }
        }
    }

    async fn handle_offer(&mut self, from: &str, sdp: String) {
        if self.peers.get(from).is_none() {
            tracing::debug!(peer = %from, "offer from unknown peer, ignoring");
            return;
        }

        // Make sure a connection exists; for a remote-initiated negotiation
        // we are the answerer.
        if self.peers.get(from).is_some_and(|e| e.conn.is_none()) {
            if let Err(e) = self.connect_peer(from).await {
                tracing::warn!(peer = %from, "failed to set up connection: {e:#}");
                if let Some(entry) = self.peers.get_mut(from) {
                    entry.arm_retry(Instant::now());
                }
                return;
            }
        }

        let Some(conn) = self.peers.get(from).and_then(|e| e.conn.clone()) else {
            return;
        };

        match conn.handle_offer(sdp).await {
            Ok(answer) => {
                if let Some(entry) = self.peers.get_mut(from) {
                    entry.state = conn.state();
                }

                self.signaling.send(Message::Answer {
                    to: from.to_owned(),
                    from: self.peers.my_id().to_owned(),
                    sdp: answer,
                });
            }
            Err(e) => {
                tracing::warn!(peer = %from, "failed to apply offer: {e}");
            }
        }
    }

    async fn handle_answer(&mut self, from: &str, sdp: String) {
        let Some(conn) = self.peers.get(from).and_then(|e| e.conn.clone()) else {
            tracing::debug!(peer = %from, "answer without a pending offer, ignoring");
            return;
        };

        if let Err(e) = conn.handle_answer(sdp).await {
            tracing::warn!(peer = %from, "failed to apply answer: {e}");
            return;
        }

        if let Some(entry) = self.peers.get_mut(from) {
            entry.state = conn.state();
        }
    }

    async fn handle_candidate(&mut self, from: &str, candidate: String) {
        let Some(conn) = self.peers.get(from).and_then(|e| e.conn.clone()) else {
            tracing::debug!(peer = %from, "candidate before negotiation, ignoring");
            return;
        };

        if let Err(e) = conn.add_remote_candidate(candidate).await {
            tracing::debug!(peer = %from, "failed to add candidate: {e}");
        }
    }

    // === peer events ======================================================

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Candidate { peer_id, candidate } => {
                self.signaling.send(Message::Candidate {
                    to: peer_id,
                    from: self.peers.my_id().to_owned(),
                    candidate,
                });
            }
            PeerEvent::State { peer_id, state } => self.handle_peer_state(&peer_id, state).await,
            PeerEvent::DataChannel { peer_id, open } => {
                if open {
                    self.handle_channel_open(&peer_id).await;
                } else if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.data_channel_open = false;
                }
            }
        }
    }

    async fn handle_peer_state(&mut self, peer_id: &str, state: PeerState) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };

        entry.state = state;

        match state {
            PeerState::Restarting => {
                // First failure on a live session: try an ICE restart. A
                // second failure within the renegotiation window tears the
                // whole connection down instead.
                let renegotiate = entry.record_ice_failure(Instant::now());

                if renegotiate {
                    tracing::info!(peer = %peer_id, "second ICE failure, renegotiating from scratch");
                    let info = entry.info.clone();
                    self.teardown_peer(peer_id, true).await;
                    self.peers.insert_discovered(info, Instant::now());
                    return;
                }

                let Some(conn) = entry.conn.clone() else {
                    return;
                };

                tracing::info!(peer = %peer_id, "running ICE restart");

                match conn.restart_ice().await {
                    Ok(offer) => {
                        self.signaling.send(Message::Offer {
                            to: peer_id.to_owned(),
                            from: self.peers.my_id().to_owned(),
                            sdp: offer,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_id, "ICE restart failed: {e}");
                        if let Some(entry) = self.peers.get_mut(peer_id) {
                            entry.state = PeerState::Failed;
                            entry.arm_retry(Instant::now());
                        }
                    }
                }
            }
            PeerState::Failed => {
                tracing::info!(peer = %peer_id, "connection failed, will retry");

                if let Some(conn) = entry.conn.take() {
                    let peer_id = peer_id.to_owned();
                    tokio::spawn(async move {
                        conn.close().await;
                        tracing::debug!(peer = %peer_id, "closed failed connection");
                    });
                }

                entry.data_channel_open = false;
                entry.state = PeerState::Failed;
                entry.arm_retry(Instant::now());
            }
            PeerState::Connected => {
                entry.mark_connected();
            }
            _ => {}
        }
    }

    async fn handle_channel_open(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };

        entry.data_channel_open = true;
        entry.state = PeerState::Connected;
        entry.mark_connected();
        entry.connected_since = Some(unix_now());

        // The negotiation made it; nothing to replay on the next signaling
        // reconnect.
        self.signaling.negotiation_complete(peer_id);

        if let Some(conn) = self.peers.get(peer_id).and_then(|e| e.conn.clone()) {
            let ice_type = conn.ice_type().await;
            if let Some(entry) = self.peers.get_mut(peer_id) {
                entry.ice_type = ice_type;
            }

            tracing::info!(peer = %peer_id, %ice_type, "peer connected");
        }

        self.apply_network_config_for(peer_id).await;
    }

    // === supervisor =======================================================

    async fn supervise(&mut self) {
        let now = Instant::now();

        for peer_id in self.peers.due_peers(now) {
            if let Err(e) = self.connect_peer(&peer_id).await {
                tracing::warn!(peer = %peer_id, "connection attempt failed: {e:#}");

                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.arm_retry(now);
                }
                continue;
            }

            // The offerer drives the negotiation; the answerer is armed and
            // waits for the remote offer.
            if self.peers.role_for(&peer_id) == Role::Offerer {
                let Some(conn) = self.peers.get(&peer_id).and_then(|e| e.conn.clone()) else {
                    continue;
                };

                match conn.create_offer().await {
                    Ok(sdp) => {
                        self.signaling.send(Message::Offer {
                            to: peer_id.clone(),
                            from: self.peers.my_id().to_owned(),
                            sdp,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_id, "failed to create offer: {e}");
                        if let Some(entry) = self.peers.get_mut(&peer_id) {
                            entry.arm_retry(now);
                        }
                    }
                }
            }
        }
    }

    /// Creates the WireGuard peer and the WebRTC connection for a peer.
    async fn connect_peer(&mut self, peer_id: &str) -> Result<()> {
        let Some(entry) = self.peers.get(peer_id) else {
            anyhow::bail!("peer is not in the table");
        };

        if entry.conn.is_some() {
            // At most one connection per peer: the supervisor never
            // double-arms, but an offer can race the tick.
            if let Some(entry) = self.peers.get_mut(peer_id) {
                entry.next_attempt = None;
            }
            return Ok(());
        }

        let info = entry.info.clone();
        let role = self.peers.role_for(peer_id);

        let public_key =
            wg_tunnel::parse_public_key(&info.public_key).context("peer public key is invalid")?;

        let allowed_ips = self.allowed_ips_for(&info)?;

        let (endpoint, outbound) = self
            .wg
            .add_peer(wg_tunnel::PeerConfig {
                public_key,
                allowed_ips,
            })
            .await
            .context("failed to add WireGuard peer")?;

        let conn = PeerConnection::new(
            PeerRtcConfig {
                peer_id: peer_id.to_owned(),
                ice_servers: self.ice_servers(),
                endpoint,
                inbound: self.wg.inbound_sender(),
                outbound,
            },
            role,
            Arc::new(EventBridge::new(self.events_tx.clone())),
        )
        .await
        .context("failed to create peer connection")?;

        let Some(entry) = self.peers.get_mut(peer_id) else {
            anyhow::bail!("peer vanished during setup");
        };

        entry.conn = Some(Arc::new(conn));
        entry.endpoint = Some(endpoint);
        entry.next_attempt = None;
        entry.state = match role {
            Role::Offerer => PeerState::Offering,
            Role::Answerer => PeerState::Answering,
        };

        tracing::debug!(peer = %peer_id, ?role, %endpoint, "peer connection armed");

        Ok(())
    }

    /// Tears down the WebRTC connection, the WireGuard peer and any kernel
    /// state installed for this peer.
    async fn teardown_peer(&mut self, peer_id: &str, remove_entry: bool) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };

        entry.data_channel_open = false;

        if let Some(conn) = entry.conn.take() {
            conn.close().await;
        }
        entry.endpoint = None;

        if let Ok(public_key) = wg_tunnel::parse_public_key(&entry.info.public_key) {
            let _ = self.wg.remove_peer(public_key).await;
        }

        for route in self.accepted_routes_for_peer(peer_id) {
            self.routes.remove_route(route).await;
        }

        self.signaling.peer_removed(peer_id);

        if remove_entry {
            self.peers.remove(peer_id);
            self.signaling.send(Message::Bye {
                to: peer_id.to_owned(),
                from: self.peers.my_id().to_owned(),
            });
        }

        self.recompute_dns();
    }

    // === control ==========================================================

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Status(reply) => {
                let _ = reply.send(self.status());
            }
            ControlRequest::Offerings(reply) => {
                let _ = reply.send(self.offerings());
            }
            ControlRequest::Configure {
                peer_id,
                selections,
                reply,
            } => {
                let result = self.configure_peer(&peer_id, selections).await;
                let _ = reply.send(result);
            }
        }
    }

    fn status(&self) -> StatusResponse {
        let peers = self
            .peers
            .iter()
            .map(|(id, entry)| PeerRow {
                id: id.clone(),
                address: entry.info.address.clone(),
                state: entry.state,
                ice_type: entry.ice_type,
                data_channel_open: entry.data_channel_open,
                accepted_routes: self
                    .accepted_routes_for_peer(id)
                    .iter()
                    .map(|r| r.to_string())
                    .collect(),
                connected_since: entry.connected_since,
            })
            .collect();

        StatusResponse {
            device_name: self.config.device_name.clone(),
            device_id: self.config.device_id.clone(),
            tunnel_address: format!(
                "{}/{}",
                self.config.tunnel_ip,
                self.config.tunnel_address.netmask()
            ),
            uptime_secs: self.started_at.elapsed().as_secs(),
            peers,
        }
    }

    fn offerings(&self) -> OfferingsResponse {
        let peers = self
            .peers
            .iter()
            .map(|(id, entry)| PeerOffering {
                id: id.clone(),
                advertised: PeerSelections {
                    routes: entry.info.routes.clone(),
                    dns: entry.info.dns.clone(),
                    dns_search: entry.info.dns_search.clone(),
                },
                accepted: self.selections.get(id).cloned().unwrap_or_default(),
            })
            .collect();

        OfferingsResponse { peers }
    }

    /// Applies a per-peer selection update atomically: persisted, kernel
    /// routes adjusted and the WireGuard peer's allowed IPs replaced in one
    /// step. Posting the same selections twice is a no-op.
    async fn configure_peer(
        &mut self,
        peer_id: &str,
        selections: PeerSelections,
    ) -> Result<(), String> {
        let Some(entry) = self.peers.get(peer_id) else {
            return Err(format!("unknown peer: {peer_id}"));
        };

        // Everything selected must currently be advertised.
        for route in &selections.routes {
            if !entry.info.routes.contains(route) {
                return Err(format!("route {route} is not advertised by {peer_id}"));
            }
        }
        for dns in &selections.dns {
            if !entry.info.dns.contains(dns) {
                return Err(format!("resolver {dns} is not advertised by {peer_id}"));
            }
        }
        for search in &selections.dns_search {
            if !entry.info.dns_search.contains(search) {
                return Err(format!("search domain {search} is not advertised by {peer_id}"));
            }
        }

        let previous = self.accepted_routes_for_peer(peer_id);

        self.selections.insert(peer_id.to_owned(), selections);

        if let Err(e) = crate::config::store_selections(&self.config_path, &self.selections) {
            // In-memory state stays authoritative.
            tracing::warn!("failed to persist peer selections: {e:#}");
        }

        let current = self.accepted_routes_for_peer(peer_id);

        for removed in previous.iter().filter(|r| !current.contains(r)) {
            self.routes.remove_route(*removed).await;
        }
        for added in current.iter().filter(|r| !previous.contains(r)) {
            if let Err(e) = self.routes.add_route(*added).await {
                tracing::warn!(route = %added, "failed to install route: {e:#}");
            }
        }

        // Update the WireGuard peer without touching the WebRTC session.
        let info = self.peers.get(peer_id).map(|e| e.info.clone());
        if let Some(info) = info {
            if let Ok(public_key) = wg_tunnel::parse_public_key(&info.public_key) {
                if let Ok(allowed_ips) = self.allowed_ips_for(&info) {
                    if let Err(e) = self.wg.update_allowed_ips(public_key, allowed_ips).await {
                        tracing::warn!(peer = %peer_id, "failed to update allowed IPs: {e}");
                    }
                }
            }
        }

        self.recompute_dns();

        Ok(())
    }

    // === network config ===================================================

    /// `[tunnel_address/32] + accepted routes`, parsed.
    fn allowed_ips_for(&self, info: &PeerInfo) -> Result<Vec<Ipv4Network>> {
        let (peer_ip, _) = parse_cidr(&info.address)
            .with_context(|| format!("peer {} has an invalid tunnel address", info.id))?;

        let mut allowed = vec![Ipv4Network::new(peer_ip, 32).expect("/32 is always valid")];
        allowed.extend(self.accepted_routes(info));

        Ok(allowed)
    }

    /// The routes of `info` the local user accepts: everything when
    /// `accept_routes` is set globally, the explicit per-peer selection
    /// otherwise.
    fn accepted_routes(&self, info: &PeerInfo) -> Vec<Ipv4Network> {
        let accepted_strings: Vec<&String> = if self.config.accept_routes {
            info.routes.iter().collect()
        } else {
            match self.selections.get(&info.id) {
                Some(selections) => selections
                    .routes
                    .iter()
                    .filter(|r| info.routes.contains(r))
                    .collect(),
                None => Vec::new(),
            }
        };

        accepted_strings
            .into_iter()
            .filter_map(|r| match r.parse::<Ipv4Network>() {
                Ok(network) => Some(network),
                Err(e) => {
                    tracing::warn!(route = %r, "ignoring unparsable route: {e}");
                    None
                }
            })
            .collect()
    }

    fn accepted_routes_for_peer(&self, peer_id: &str) -> Vec<Ipv4Network> {
        self.peers
            .get(peer_id)
            .map(|entry| self.accepted_routes(&entry.info))
            .unwrap_or_default()
    }

    /// Installs routes and DNS for a freshly connected peer.
    async fn apply_network_config_for(&mut self, peer_id: &str) {
        for route in self.accepted_routes_for_peer(peer_id) {
            if let Err(e) = self.routes.add_route(route).await {
                tracing::warn!(route = %route, "failed to install route: {e:#}");
            }
        }

        self.recompute_dns();
    }

    /// Re-derives the accepted resolver set from all connected peers.
    fn recompute_dns(&mut self) {
        let mut servers: Vec<IpAddr> = Vec::new();
        let mut search: Vec<String> = Vec::new();

        for (id, entry) in self.peers.iter() {
            if !entry.data_channel_open {
                continue;
            }

            let Some(selections) = self.selections.get(id) else {
                continue;
            };

            for dns in &selections.dns {
                if !entry.info.dns.contains(dns) {
                    continue;
                }
                match dns.parse::<IpAddr>() {
                    Ok(ip) if !servers.contains(&ip) => servers.push(ip),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(%dns, "ignoring unparsable resolver: {e}"),
                }
            }

            for domain in &selections.dns_search {
                if entry.info.dns_search.contains(domain) && !search.contains(domain) {
                    search.push(domain.clone());
                }
            }
        }

        if let Err(e) = self.dns.apply(&servers, &search) {
            tracing::warn!("failed to apply DNS configuration: {e:#}");
        }
    }

    /// STUN servers from config plus the TURN relay behind the local
    /// WebSocket bridge.
    fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .config
            .ice_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let (username, credential) = make_credentials(
            &self.turn_secret,
            &self.config.device_id,
            TURN_CREDENTIAL_TTL,
            SystemTime::now(),
        );

        servers.push(IceServer {
            urls: vec![format!(
                "turn:{}?transport=udp",
                self.turn_bridge.turn_server_addr()
            )],
            username,
            credential,
        });

        servers
    }

    // === shutdown =========================================================

    async fn shutdown(&mut self) {
        tracing::info!("shutting down");

        // Stop accepting new signaling work first.
        self.signaling.close();
        let drain = future::poll_fn(|cx| self.signaling.poll(cx));
        let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;

        // Close every peer connection in parallel, bounded by a deadline.
        let peer_ids: Vec<String> = self.peers.iter().map(|(id, _)| id.clone()).collect();
        let mut closing = Vec::new();

        for id in &peer_ids {
            if let Some(entry) = self.peers.get_mut(id) {
                if let Some(conn) = entry.conn.take() {
                    closing.push(async move { conn.close().await });
                }
            }
        }

        let close_all = future::join_all(closing);
        if tokio::time::timeout(PEER_CLOSE_DEADLINE, close_all)
            .await
            .is_err()
        {
            tracing::warn!("some peer connections did not close in time");
        }

        // Revert everything we did to the host.
        self.routes.unwind().await;

        if let Err(e) = self.dns.restore() {
            tracing::warn!("failed to restore DNS configuration: {e:#}");
        }

        tracing::info!("shutdown complete");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is set after 1970")
        .as_secs()
}
