use crate::{Error, IceServer, IceType, PeerEvents, PeerState, DATA_CHANNEL_LABEL};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use wg_tunnel::TaggedDatagram;

/// How long an ICE restart may take before the connection is declared
/// failed.
const RESTART_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether this side initiates the offer. Decided by ordered comparison of
/// device ids: the smaller id offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

pub struct PeerRtcConfig {
    pub peer_id: String,
    pub ice_servers: Vec<IceServer>,
    /// The synthetic endpoint WireGuard knows this peer by.
    pub endpoint: SocketAddr,
    /// Where received datagrams go, tagged with `endpoint`.
    pub inbound: mpsc::Sender<TaggedDatagram>,
    /// Encrypted datagrams WireGuard wants delivered to this peer.
    pub outbound: wg_tunnel::OutboundReceiver,
}

/// One WebRTC connection to a remote device.
pub struct PeerConnection {
    peer_id: String,
    role: Role,
    pc: Arc<RTCPeerConnection>,
    events: Arc<dyn PeerEvents>,

    state: Arc<Mutex<PeerState>>,

    data_channel: Arc<TokioMutex<Option<Arc<RTCDataChannel>>>>,

    /// Remote candidates that arrived before the remote description.
    pending_candidates: Arc<TokioMutex<Vec<String>>>,
    /// ufrag of the current remote description; candidates for another
    /// ufrag are stale and dropped.
    remote_ufrag: Arc<Mutex<Option<String>>>,

    /// Candidates gathered during a non-trickle restart stay out of the
    /// signaling channel; they ride along in the SDP instead.
    suppress_trickle: Arc<AtomicBool>,

    /// Bumped on every restart and on connect; outstanding restart
    /// watchdogs only fire if their epoch is still current.
    restart_epoch: Arc<AtomicU64>,
}

impl PeerConnection {
    pub async fn new(
        config: PeerRtcConfig,
        role: Role,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Self, Error> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let peer = Self {
            peer_id: config.peer_id.clone(),
            role,
            pc,
            events,
            state: Arc::new(Mutex::new(PeerState::New)),
            data_channel: Arc::new(TokioMutex::new(None)),
            pending_candidates: Arc::new(TokioMutex::new(Vec::new())),
            remote_ufrag: Arc::new(Mutex::new(None)),
            suppress_trickle: Arc::new(AtomicBool::new(false)),
            restart_epoch: Arc::new(AtomicU64::new(0)),
        };

        peer.register_pc_callbacks();
        peer.wire_transport(config.endpoint, config.inbound, config.outbound)
            .await;

        Ok(peer)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("state lock never poisoned")
    }

    pub async fn data_channel_open(&self) -> bool {
        self.data_channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|dc| dc.ready_state() == webrtc::data_channel::data_channel_state::RTCDataChannelState::Open)
    }

    /// Creates the initial (trickle) offer. Only valid for the offerer.
    pub async fn create_offer(&self) -> Result<String, Error> {
        debug_assert_eq!(self.role, Role::Offerer);

        self.set_state(PeerState::Offering);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        Ok(offer.sdp)
    }

    /// Applies a remote offer and produces the local answer.
    ///
    /// Also used for remote-initiated ICE restarts: a fresh offer simply
    /// renegotiates over the existing connection.
    pub async fn handle_offer(&self, sdp: String) -> Result<String, Error> {
        if self.state() == PeerState::New {
            self.set_state(PeerState::Answering);
        }

        let offer = RTCSessionDescription::offer(sdp.clone())?;
        self.store_remote_ufrag(&sdp);
        self.pc.set_remote_description(offer).await?;

        self.flush_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        self.set_state(PeerState::Connecting);

        Ok(answer.sdp)
    }

    /// Applies the remote answer to our pending offer.
    pub async fn handle_answer(&self, sdp: String) -> Result<(), Error> {
        let answer = RTCSessionDescription::answer(sdp.clone())?;
        self.store_remote_ufrag(&sdp);
        self.pc.set_remote_description(answer).await?;

        self.flush_pending_candidates().await;

        if matches!(self.state(), PeerState::Offering | PeerState::Restarting) {
            self.set_state(PeerState::Connecting);
        }

        Ok(())
    }

    /// Buffers or applies a trickled remote candidate.
    ///
    /// Candidates arriving before the remote description are held back and
    /// replayed after it is set; candidates for a stale ufrag are dropped
    /// silently.
    pub async fn add_remote_candidate(&self, candidate: String) -> Result<(), Error> {
        if self.is_stale_candidate(&candidate) {
            tracing::debug!(peer = %self.peer_id, "dropping candidate for stale ufrag");
            return Ok(());
        }

        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.lock().await.push(candidate);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Builds a non-trickle ICE restart offer.
    ///
    /// The returned SDP contains the complete fresh candidate list so the
    /// remote side never sees candidates with a mismatched ufrag. The data
    /// channel and DTLS session survive the restart.
    pub async fn restart_ice(&self) -> Result<String, Error> {
        // A still-pending local offer is replaced, not stacked; setting the
        // new local description below discards it.
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            tracing::debug!(peer = %self.peer_id, "replacing pending offer with restart offer");
        }

        self.set_state(PeerState::Restarting);
        self.suppress_trickle.store(true, Ordering::SeqCst);

        let epoch = self.restart_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let result = self.build_restart_offer().await;

        self.suppress_trickle.store(false, Ordering::SeqCst);

        self.arm_restart_watchdog(epoch);

        result
    }

    async fn build_restart_offer(&self) -> Result<String, Error> {
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };

        let mut gather_complete = self.pc.gathering_complete_promise().await;

        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer).await?;

        // Restart offers are non-trickle: wait until gathering finished so
        // the SDP carries every candidate.
        let _ = gather_complete.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or(Error::NoRemoteDescription)?;

        Ok(local.sdp)
    }

    /// Current path type of the selected candidate pair.
    pub async fn ice_type(&self) -> IceType {
        let transport = self.pc.sctp().transport().ice_transport();

        let Some(pair) = transport.get_selected_candidate_pair().await else {
            return IceType::Unknown;
        };

        match pair.local.typ {
            RTCIceCandidateType::Host => IceType::Host,
            RTCIceCandidateType::ServerReflexive | RTCIceCandidateType::PeerReflexive => {
                IceType::Srflx
            }
            RTCIceCandidateType::Relay => IceType::Relay,
            RTCIceCandidateType::Unspecified => IceType::Unknown,
        }
    }

    pub async fn close(&self) {
        self.set_state(PeerState::Closed);

        if let Err(e) = self.pc.close().await {
            tracing::debug!(peer = %self.peer_id, "error closing peer connection: {e}");
        }
    }

    fn register_pc_callbacks(&self) {
        // Trickle local candidates to the agent unless a non-trickle
        // restart is gathering.
        {
            let events = self.events.clone();
            let peer_id = self.peer_id.clone();
            let suppress = self.suppress_trickle.clone();

            self.pc
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let events = events.clone();
                    let peer_id = peer_id.clone();
                    let suppress = suppress.clone();

                    Box::pin(async move {
                        let Some(candidate) = candidate else {
                            return;
                        };

                        if suppress.load(Ordering::SeqCst) {
                            return;
                        }

                        match candidate.to_json() {
                            Ok(init) => events.on_candidate(&peer_id, init.candidate),
                            Err(e) => {
                                tracing::debug!(peer = %peer_id, "failed to serialize candidate: {e}")
                            }
                        }
                    })
                }));
        }

        // Surface connection-state changes.
        {
            let events = self.events.clone();
            let peer_id = self.peer_id.clone();
            let state = self.state.clone();
            let epoch = self.restart_epoch.clone();

            self.pc.on_peer_connection_state_change(Box::new(
                move |pc_state: RTCPeerConnectionState| {
                    let events = events.clone();
                    let peer_id = peer_id.clone();
                    let state = state.clone();
                    let epoch = epoch.clone();

                    Box::pin(async move {
                        let current = *state.lock().expect("state lock never poisoned");

                        let next = match pc_state {
                            RTCPeerConnectionState::Connecting => None,
                            RTCPeerConnectionState::Connected => {
                                // `connected` in the peer table means "data
                                // channel open"; the channel callback takes
                                // it from here.
                                epoch.fetch_add(1, Ordering::SeqCst);
                                None
                            }
                            RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed => match current {
                                // A live session prefers an ICE restart over
                                // a teardown.
                                PeerState::Connected => Some(PeerState::Restarting),
                                PeerState::Closed | PeerState::Restarting => None,
                                _ => Some(PeerState::Failed),
                            },
                            RTCPeerConnectionState::Closed => match current {
                                PeerState::Closed => None,
                                _ => Some(PeerState::Closed),
                            },
                            _ => None,
                        };

                        if let Some(next) = next {
                            let changed = {
                                let mut guard =
                                    state.lock().expect("state lock never poisoned");
                                let changed = *guard != next;
                                *guard = next;
                                changed
                            };

                            if changed {
                                events.on_state(&peer_id, next);
                            }
                        }
                    })
                },
            ));
        }
    }

    /// Hooks the data channel up to WireGuard's bind shim.
    async fn wire_transport(
        &self,
        endpoint: SocketAddr,
        inbound: mpsc::Sender<TaggedDatagram>,
        outbound: wg_tunnel::OutboundReceiver,
    ) {
        let outbound = Arc::new(TokioMutex::new(Some(outbound)));

        match self.role {
            Role::Offerer => {
                // The channel must exist before the offer so it shows up in
                // the SDP. Unreliable and unordered: WireGuard brings its
                // own reliability.
                let init = RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                };

                match self
                    .pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                    .await
                {
                    Ok(dc) => {
                        self.adopt_data_channel(dc, endpoint, inbound, outbound.clone())
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %self.peer_id, "failed to create data channel: {e}")
                    }
                }
            }
            Role::Answerer => {
                let slot = self.data_channel.clone();
                let events = self.events.clone();
                let state = self.state.clone();
                let peer_id = self.peer_id.clone();
                let this_inbound = inbound.clone();
                let outbound = outbound.clone();
                let pending = PendingAdoption {
                    endpoint,
                    events,
                    state,
                    peer_id,
                };

                self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let inbound = this_inbound.clone();
                    let outbound = outbound.clone();
                    let pending = pending.clone();

                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            tracing::debug!(label = %dc.label(), "ignoring unexpected data channel");
                            return;
                        }

                        register_dc_callbacks(&dc, &pending, inbound, outbound);
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }
    }

    async fn adopt_data_channel(
        &self,
        dc: Arc<RTCDataChannel>,
        endpoint: SocketAddr,
        inbound: mpsc::Sender<TaggedDatagram>,
        outbound: Arc<TokioMutex<Option<wg_tunnel::OutboundReceiver>>>,
    ) {
        let pending = PendingAdoption {
            endpoint,
            events: self.events.clone(),
            state: self.state.clone(),
            peer_id: self.peer_id.clone(),
        };

        register_dc_callbacks(&dc, &pending, inbound, outbound);
        *self.data_channel.lock().await = Some(dc);
    }

    async fn flush_pending_candidates(&self) {
        let buffered = std::mem::take(&mut *self.pending_candidates.lock().await);

        for candidate in buffered {
            if let Err(e) = self
                .pc
                .add_ice_candidate(RTCIceCandidateInit {
                    candidate,
                    ..Default::default()
                })
                .await
            {
                tracing::debug!(peer = %self.peer_id, "failed to apply buffered candidate: {e}");
            }
        }
    }

    fn store_remote_ufrag(&self, sdp: &str) {
        *self
            .remote_ufrag
            .lock()
            .expect("ufrag lock never poisoned") = parse_ufrag(sdp);
    }

    fn is_stale_candidate(&self, candidate: &str) -> bool {
        let Some(candidate_ufrag) = candidate_ufrag(candidate) else {
            return false;
        };

        let current = self
            .remote_ufrag
            .lock()
            .expect("ufrag lock never poisoned")
            .clone();

        match current {
            Some(ufrag) => ufrag != candidate_ufrag,
            // Without a remote description yet we cannot judge; buffer it.
            None => false,
        }
    }

    fn set_state(&self, next: PeerState) {
        let changed = {
            let mut guard = self.state.lock().expect("state lock never poisoned");
            if *guard == PeerState::Closed && next != PeerState::Closed {
                return;
            }
            let changed = *guard != next;
            *guard = next;
            changed
        };

        if changed {
            self.events.on_state(&self.peer_id, next);
        }
    }

    fn arm_restart_watchdog(&self, epoch: u64) {
        let state = self.state.clone();
        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        let current_epoch = self.restart_epoch.clone();

        tokio::spawn(async move {
            tokio::time::sleep(RESTART_CONVERGENCE_TIMEOUT).await;

            if current_epoch.load(Ordering::SeqCst) != epoch {
                // Connected (or restarted again) in the meantime.
                return;
            }

            let timed_out = {
                let mut guard = state.lock().expect("state lock never poisoned");
                if *guard == PeerState::Restarting {
                    *guard = PeerState::Failed;
                    true
                } else {
                    false
                }
            };

            if timed_out {
                tracing::warn!(peer = %peer_id, "ICE restart did not converge in time");
                events.on_state(&peer_id, PeerState::Failed);
            }
        });
    }
}

/// Everything the data-channel callbacks need, bundled so the closures stay
/// readable.
#[derive(Clone)]
struct PendingAdoption {
    endpoint: SocketAddr,
    events: Arc<dyn PeerEvents>,
    state: Arc<Mutex<PeerState>>,
    peer_id: String,
}

fn register_dc_callbacks(
    dc: &Arc<RTCDataChannel>,
    ctx: &PendingAdoption,
    inbound: mpsc::Sender<TaggedDatagram>,
    outbound: Arc<TokioMutex<Option<wg_tunnel::OutboundReceiver>>>,
) {
    // on_open: mark connected and start pumping WireGuard's outbound queue
    // into the channel.
    {
        let ctx = ctx.clone();
        let dc2 = dc.clone();

        dc.on_open(Box::new(move || {
            let ctx = ctx.clone();
            let dc2 = dc2.clone();
            let outbound = outbound.clone();

            Box::pin(async move {
                tracing::debug!(peer = %ctx.peer_id, "data channel open");

                {
                    let mut guard = ctx.state.lock().expect("state lock never poisoned");
                    if *guard != PeerState::Closed {
                        *guard = PeerState::Connected;
                    }
                }
                ctx.events.on_state(&ctx.peer_id, PeerState::Connected);
                ctx.events.on_data_channel(&ctx.peer_id, true);

                let Some(mut rx) = outbound.lock().await.take() else {
                    // Re-opened after a restart; the pump is still running.
                    return;
                };

                let dc = dc2.clone();
                let peer_id = ctx.peer_id.clone();
                tokio::spawn(async move {
                    while let Some(datagram) = rx.recv().await {
                        if let Err(e) = dc.send(&datagram).await {
                            tracing::trace!(peer = %peer_id, "data channel send failed: {e}");

                            if dc.ready_state()
                                != webrtc::data_channel::data_channel_state::RTCDataChannelState::Open
                            {
                                break;
                            }
                        }
                    }
                });
            })
        }));
    }

    // on_message: tag with the synthetic endpoint and hand to WireGuard.
    {
        let endpoint = ctx.endpoint;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = inbound.clone();

            Box::pin(async move {
                if let Err(e) = inbound.try_send((endpoint, msg.data)) {
                    tracing::trace!("inbound queue full, dropping datagram: {e}");
                }
            })
        }));
    }

    // on_close: the tunnel to this peer is gone.
    {
        let ctx = ctx.clone();
        dc.on_close(Box::new(move || {
            let ctx = ctx.clone();

            Box::pin(async move {
                tracing::debug!(peer = %ctx.peer_id, "data channel closed");

                ctx.events.on_data_channel(&ctx.peer_id, false);
            })
        }));
    }
}

fn parse_ufrag(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
        .map(|ufrag| ufrag.trim().to_owned())
}

/// Extracts the `ufrag` hint some stacks append to candidate strings.
fn candidate_ufrag(candidate: &str) -> Option<String> {
    let mut tokens = candidate.split_whitespace();

    while let Some(token) = tokens.next() {
        if token == "ufrag" {
            return tokens.next().map(|u| u.to_owned());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ufrag_from_sdp() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\na=ice-ufrag:EsAw\r\na=ice-pwd:secret\r\n";

        assert_eq!(parse_ufrag(sdp), Some("EsAw".to_owned()));
    }

    #[test]
    fn sdp_without_ufrag_yields_none() {
        assert_eq!(parse_ufrag("v=0\r\n"), None);
    }

    #[test]
    fn extracts_candidate_ufrag_hint() {
        let candidate =
            "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host ufrag EsAw network-id 1";

        assert_eq!(candidate_ufrag(candidate), Some("EsAw".to_owned()));
    }

    #[test]
    fn candidate_without_ufrag_is_not_stale() {
        let candidate = "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host";

        assert_eq!(candidate_ufrag(candidate), None);
    }
}
