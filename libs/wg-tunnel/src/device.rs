use crate::endpoint::EndpointAllocator;
use crate::{Error, TaggedDatagram, PERSISTENT_KEEPALIVE};
use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Tunn, TunnResult};
use bytes::Bytes;
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tun_device::TunDevice;
use x25519_dalek::{PublicKey, StaticSecret};

/// Upper bound for one encrypted datagram on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Scratch space for boringtun; fits a full datagram plus noise overhead.
const BUF_SIZE: usize = MAX_DATAGRAM_SIZE + 160;

/// Interval between boringtun timer ticks.
const TIMER_TICK: Duration = Duration::from_millis(250);

/// How many encrypted datagrams may queue towards one data channel before
/// we drop. WireGuard retransmits, so this stays small on purpose.
const OUTBOUND_CHANNEL_DEPTH: usize = 64;

/// Configuration for one remote WireGuard peer.
pub struct PeerConfig {
    pub public_key: PublicKey,
    /// `[tunnel_address/32] + accepted routes`.
    pub allowed_ips: Vec<IpNetwork>,
}

/// Handle to the running WireGuard device task.
///
/// The task owns the TUN device and all per-peer noise state; the handle
/// sends it commands and injects datagrams received from peer transports.
pub struct WgTunnel {
    cmd_tx: mpsc::Sender<Command>,
    inbound_tx: mpsc::Sender<TaggedDatagram>,
    endpoints: std::sync::Arc<EndpointAllocator>,
}

enum Command {
    AddPeer {
        config: PeerConfig,
        endpoint: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    UpdateAllowedIps {
        public_key: PublicKey,
        allowed_ips: Vec<IpNetwork>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    RemovePeer {
        public_key: PublicKey,
        done: oneshot::Sender<()>,
    },
}

/// The sending half a peer transport reads encrypted datagrams from.
pub type OutboundReceiver = mpsc::Receiver<Bytes>;

impl WgTunnel {
    /// Spawns the device task on the current runtime.
    pub fn start(tun: TunDevice, private_key: StaticSecret, cancel: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        let task = DeviceTask {
            tun,
            private_key,
            peers: HashMap::new(),
            peers_by_endpoint: HashMap::new(),
            routes: IpNetworkTable::new(),
            next_peer_index: 0,
            cmd_rx,
            inbound_rx,
            cancel,
        };

        tokio::spawn(task.run());

        Self {
            cmd_tx,
            inbound_tx,
            endpoints: std::sync::Arc::new(EndpointAllocator::new()),
        }
    }

    /// Adds a peer and returns its synthetic endpoint together with the
    /// receiver its transport must drain.
    ///
    /// Packets sent while the transport's queue is full are dropped.
    pub async fn add_peer(
        &self,
        config: PeerConfig,
    ) -> Result<(SocketAddr, OutboundReceiver), Error> {
        let endpoint = self.endpoints.allocate();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_DEPTH);
        let (done, wait) = oneshot::channel();

        self.cmd_tx
            .send(Command::AddPeer {
                config,
                endpoint,
                outbound: outbound_tx,
                done,
            })
            .await
            .map_err(|_| Error::DeviceGone)?;

        wait.await.map_err(|_| Error::DeviceGone)??;

        Ok((endpoint, outbound_rx))
    }

    /// Replaces the peer's allowed-IPs set (tunnel address + accepted
    /// routes) in one step.
    pub async fn update_allowed_ips(
        &self,
        public_key: PublicKey,
        allowed_ips: Vec<IpNetwork>,
    ) -> Result<(), Error> {
        let (done, wait) = oneshot::channel();

        self.cmd_tx
            .send(Command::UpdateAllowedIps {
                public_key,
                allowed_ips,
                done,
            })
            .await
            .map_err(|_| Error::DeviceGone)?;

        wait.await.map_err(|_| Error::DeviceGone)?
    }

    pub async fn remove_peer(&self, public_key: PublicKey) -> Result<(), Error> {
        let (done, wait) = oneshot::channel();

        self.cmd_tx
            .send(Command::RemovePeer { public_key, done })
            .await
            .map_err(|_| Error::DeviceGone)?;

        wait.await.map_err(|_| Error::DeviceGone)
    }

    /// The sender peer transports push received datagrams into, tagged with
    /// the peer's synthetic endpoint.
    pub fn inbound_sender(&self) -> mpsc::Sender<TaggedDatagram> {
        self.inbound_tx.clone()
    }
}

struct PeerState {
    tunn: Tunn,
    endpoint: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    allowed_ips: Vec<IpNetwork>,
}

impl PeerState {
    /// Hands one encrypted datagram to the peer's transport, dropping it if
    /// the transport is closed or congested.
    fn send_datagram(&self, datagram: &[u8]) {
        match self.outbound.try_send(Bytes::copy_from_slice(datagram)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(endpoint = %self.endpoint, "transport congested, dropping datagram");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(endpoint = %self.endpoint, "transport closed, dropping datagram");
            }
        }
    }
}

struct DeviceTask {
    tun: TunDevice,
    private_key: StaticSecret,

    peers: HashMap<[u8; 32], PeerState>,
    peers_by_endpoint: HashMap<SocketAddr, [u8; 32]>,
    /// Longest-prefix-match table from allowed IPs to the owning peer.
    routes: IpNetworkTable<[u8; 32]>,

    next_peer_index: u32,

    cmd_rx: mpsc::Receiver<Command>,
    inbound_rx: mpsc::Receiver<TaggedDatagram>,
    cancel: CancellationToken,
}

impl DeviceTask {
    async fn run(mut self) {
        let mut tun_buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut scratch = [0u8; BUF_SIZE];
        let mut ticker = tokio::time::interval(TIMER_TICK);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd),
                result = self.tun.read(&mut tun_buf) => {
                    match result {
                        Ok(n) => self.handle_tun_packet(&tun_buf[..n], &mut scratch),
                        Err(e) => {
                            tracing::error!("TUN read failed: {e}");
                            break;
                        }
                    }
                }
                Some((endpoint, datagram)) = self.inbound_rx.recv() => {
                    self.handle_peer_datagram(endpoint, &datagram, &mut scratch).await;
                }
                _ = ticker.tick() => self.handle_timers(&mut scratch),
            }
        }

        tracing::debug!("WireGuard device task stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddPeer {
                config,
                endpoint,
                outbound,
                done,
            } => {
                let result = self.add_peer(config, endpoint, outbound);
                let _ = done.send(result);
            }
            Command::UpdateAllowedIps {
                public_key,
                allowed_ips,
                done,
            } => {
                let result = self.update_allowed_ips(public_key, allowed_ips);
                let _ = done.send(result);
            }
            Command::RemovePeer { public_key, done } => {
                self.remove_peer(public_key);
                let _ = done.send(());
            }
        }
    }

    fn add_peer(
        &mut self,
        config: PeerConfig,
        endpoint: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<(), Error> {
        let key = config.public_key.to_bytes();

        // A duplicate add replaces the previous peer wholesale; WireGuard
        // state from the old session is useless with a fresh transport.
        self.remove_peer(config.public_key);

        let index = self.next_peer_index;
        self.next_peer_index = self.next_peer_index.wrapping_add(1);

        let tunn = Tunn::new(
            self.private_key.clone(),
            config.public_key,
            None,
            Some(PERSISTENT_KEEPALIVE),
            index,
            None,
        );

        for network in &config.allowed_ips {
            self.routes.insert(*network, key);
        }
        self.peers_by_endpoint.insert(endpoint, key);
        self.peers.insert(
            key,
            PeerState {
                tunn,
                endpoint,
                outbound,
                allowed_ips: config.allowed_ips,
            },
        );

        tracing::debug!(%endpoint, "added WireGuard peer");

        Ok(())
    }

    fn update_allowed_ips(
        &mut self,
        public_key: PublicKey,
        allowed_ips: Vec<IpNetwork>,
    ) -> Result<(), Error> {
        let key = public_key.to_bytes();

        let peer = self
            .peers
            .get_mut(&key)
            .ok_or_else(|| Error::UnknownPeer(base64_key(&key)))?;

        for network in &peer.allowed_ips {
            self.routes.remove(*network);
        }
        for network in &allowed_ips {
            self.routes.insert(*network, key);
        }

        peer.allowed_ips = allowed_ips;

        Ok(())
    }

    fn remove_peer(&mut self, public_key: PublicKey) {
        let key = public_key.to_bytes();

        let Some(peer) = self.peers.remove(&key) else {
            return;
        };

        self.peers_by_endpoint.remove(&peer.endpoint);
        for network in &peer.allowed_ips {
            self.routes.remove(*network);
        }

        tracing::debug!(endpoint = %peer.endpoint, "removed WireGuard peer");
    }

    /// Plaintext packet from the kernel: route to a peer and encrypt.
    fn handle_tun_packet(&mut self, packet: &[u8], scratch: &mut [u8]) {
        let Some(dst) = dst_ip(packet) else {
            return;
        };

        let Some((_, key)) = self.routes.longest_match(dst) else {
            tracing::trace!(%dst, "no peer for destination, dropping packet");
            return;
        };

        let Some(peer) = self.peers.get_mut(key) else {
            return;
        };

        match peer.tunn.encapsulate(packet, scratch) {
            TunnResult::WriteToNetwork(datagram) => {
                peer.send_datagram(datagram);
            }
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                tracing::debug!(?e, "failed to encapsulate packet");
            }
            _ => {}
        }
    }

    /// Encrypted datagram from a peer transport: decrypt and write to TUN.
    async fn handle_peer_datagram(
        &mut self,
        endpoint: SocketAddr,
        datagram: &[u8],
        scratch: &mut [u8],
    ) {
        let Some(key) = self.peers_by_endpoint.get(&endpoint).copied() else {
            tracing::trace!(%endpoint, "datagram for unknown endpoint");
            return;
        };

        enum Verdict {
            ToTun(Vec<u8>),
            Nothing,
        }

        let verdict = {
            let Some(peer) = self.peers.get_mut(&key) else {
                return;
            };

            let routes = &self.routes;
            let allowed_source = |src: IpAddr| {
                routes
                    .longest_match(src)
                    .is_some_and(|(_, peer)| peer == &key)
            };

            match peer.tunn.decapsulate(None, datagram, scratch) {
                TunnResult::WriteToNetwork(response) => {
                    // Handshake traffic; flush everything boringtun queued.
                    peer.send_datagram(response);

                    let mut flush_buf = [0u8; BUF_SIZE];
                    while let TunnResult::WriteToNetwork(queued) =
                        peer.tunn.decapsulate(None, &[], &mut flush_buf)
                    {
                        peer.send_datagram(queued);
                    }

                    Verdict::Nothing
                }
                TunnResult::WriteToTunnelV4(packet, src) => {
                    if allowed_source(IpAddr::V4(src)) {
                        Verdict::ToTun(packet.to_vec())
                    } else {
                        tracing::debug!(%src, "source address outside peer's allowed IPs");
                        Verdict::Nothing
                    }
                }
                TunnResult::WriteToTunnelV6(packet, src) => {
                    if allowed_source(IpAddr::V6(src)) {
                        Verdict::ToTun(packet.to_vec())
                    } else {
                        tracing::debug!(%src, "source address outside peer's allowed IPs");
                        Verdict::Nothing
                    }
                }
                TunnResult::Done => Verdict::Nothing,
                TunnResult::Err(WireGuardError::NoCurrentSession) => {
                    tracing::trace!("datagram before handshake completion, dropping");
                    Verdict::Nothing
                }
                TunnResult::Err(e) => {
                    tracing::debug!(?e, "failed to decapsulate datagram");
                    Verdict::Nothing
                }
            }
        };

        if let Verdict::ToTun(packet) = verdict {
            if let Err(e) = self.tun.write(&packet).await {
                tracing::debug!("TUN write failed: {e}");
            }
        }
    }

    fn handle_timers(&mut self, scratch: &mut [u8]) {
        for peer in self.peers.values_mut() {
            match peer.tunn.update_timers(scratch) {
                TunnResult::WriteToNetwork(datagram) => {
                    peer.send_datagram(datagram);
                }
                TunnResult::Err(e) => {
                    tracing::trace!(?e, endpoint = %peer.endpoint, "timer error");
                }
                _ => {}
            }
        }
    }
}

fn base64_key(key: &[u8; 32]) -> String {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine as _;

    BASE64_STANDARD.encode(key)
}

/// Extracts the destination address of a raw IP packet.
fn dst_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_ip_of_ipv4_packet() {
        let mut packet = [0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 0, 0, 2]);

        assert_eq!(dst_ip(&packet), Some(IpAddr::from([10, 0, 0, 2])));
    }

    #[test]
    fn dst_ip_of_ipv6_packet() {
        let mut packet = [0u8; 40];
        packet[0] = 0x60;
        packet[24..40].copy_from_slice(&[0xfd; 16]);

        assert_eq!(dst_ip(&packet), Some(IpAddr::from([0xfd; 16])));
    }

    #[test]
    fn truncated_packet_has_no_destination() {
        assert_eq!(dst_ip(&[0x45, 0, 0]), None);
    }
}
