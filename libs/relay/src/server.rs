use crate::auth::{AuthenticatedMessage, MessageIntegrityExt};
use crate::client_message::{
    Allocate, Binding, ChannelBind, ClientMessage, CreatePermission, Decoder, ProtectedRequest,
    Refresh, Send, StunRequest, UDP_TRANSPORT,
};
use crate::fingerprint::append_fingerprint;
use crate::{channel_data, Attribute, ChannelData, CHANNEL_NUMBER_RANGE, REALM, SOFTWARE};
use bytecodec::EncodeExt;
use core::fmt;
use secrecy::SecretString;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant, SystemTime};
use stun_codec::rfc5389::attributes::{ErrorCode, Nonce, Username, XorMappedAddress};
use stun_codec::rfc5389::errors::{BadRequest, ServerError, StaleNonce, Unauthorized};
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5766::attributes::{Data, Lifetime, XorPeerAddress, XorRelayAddress};
use stun_codec::rfc5766::errors::{AllocationMismatch, InsufficientCapacity};
use stun_codec::rfc5766::methods::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH};
use stun_codec::{Message, MessageClass, Method, TransactionId};
use uuid::Uuid;

/// Identifies one TURN WebSocket connection.
///
/// Relay clients are not addressable by socket address (everything arrives
/// over WebSockets terminated by the worker), so the worker assigns every
/// connection an id and the server keys all state by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// A virtual relay address.
///
/// These only exist inside the server's allocation table; they satisfy ICE's
/// need for a relayed candidate address without any kernel socket behind it.
pub type RelayAddr = SocketAddr;

/// The network all virtual relay addresses are drawn from.
const RELAY_NET: [u8; 2] = [10, 255];

/// The first port handed out for virtual relay addresses.
const LOWEST_RELAY_PORT: u16 = 50_000;

/// How many distinct relay addresses can be live at once.
const MAX_AVAILABLE_ADDRESSES: u32 = 0xFFFF;

/// The duration of a channel binding.
const CHANNEL_BINDING_DURATION: Duration = Duration::from_secs(600);

/// Cooldown before an expired channel number may be bound to another peer.
const CHANNEL_REBIND_TIMEOUT: Duration = Duration::from_secs(300);

/// Permissions last 5 minutes, refreshed by CreatePermission or ChannelBind.
const PERMISSION_DURATION: Duration = Duration::from_secs(300);

/// A sans-IO STUN & TURN server for WebSocket-attached clients.
///
/// Callers feed frames in via [`Server::handle_client_input`] and drain
/// [`Command`]s describing which frames to write to which connection.
pub struct Server {
    decoder: Decoder,

    /// All client allocations, indexed by connection.
    allocations: BTreeMap<ClientId, Allocation>,
    clients_by_relay_addr: HashMap<RelayAddr, ClientId>,

    /// Channel bindings, unique per client and number.
    channels: BTreeMap<(ClientId, u16), Channel>,
    channel_numbers_by_client_and_peer: HashMap<(ClientId, RelayAddr), u16>,

    /// The observed remote address per connection, for Binding responses.
    observed_addresses: HashMap<ClientId, SocketAddr>,

    pending_commands: VecDeque<Command>,

    turn_secret: SecretString,
    nonces: NonceBook,

    next_relay_index: u32,
}

/// The side-effects a [`Server`] asks its caller to perform.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Write one binary frame to the given connection.
    SendFrame {
        payload: Vec<u8>,
        recipient: ClientId,
    },
    /// Wake the server at the given deadline via [`Server::handle_deadline_reached`].
    Wake { deadline: Instant },
}

impl Server {
    pub fn new(turn_secret: SecretString) -> Self {
        Self {
            decoder: Decoder::default(),
            allocations: Default::default(),
            clients_by_relay_addr: Default::default(),
            channels: Default::default(),
            channel_numbers_by_client_and_peer: Default::default(),
            observed_addresses: Default::default(),
            pending_commands: Default::default(),
            turn_secret,
            nonces: NonceBook::default(),
            next_relay_index: 0,
        }
    }

    /// Records a new connection and the remote address it arrived from.
    pub fn client_connected(&mut self, client: ClientId, observed_addr: SocketAddr) {
        self.observed_addresses.insert(client, observed_addr);
    }

    /// Tears down all state of a disconnected client.
    ///
    /// The WebSocket *is* the allocation: once it goes away there is nothing
    /// left to relay to, so the allocation dies with it.
    pub fn client_disconnected(&mut self, client: ClientId) {
        self.observed_addresses.remove(&client);
        self.delete_allocation(client);
    }

    pub fn num_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Looks up the relay address currently allocated to a client.
    pub fn relay_addr_of(&self, client: ClientId) -> Option<RelayAddr> {
        Some(self.allocations.get(&client)?.relay_addr)
    }

    /// Process one frame received from a client connection.
    ///
    /// Afterwards, drain [`Server::next_command`] until it returns `None`.
    pub fn handle_client_input(&mut self, frame: &[u8], sender: ClientId, now: Instant) {
        let message = match self.decoder.decode(frame) {
            Ok(Ok(message)) => message,
            Ok(Err(error_response)) => {
                tracing::debug!(target: "relay", %sender, "replying to undecodable message with an error");

                self.send_unauthenticated(error_response, sender);
                return;
            }
            Err(e) => {
                tracing::debug!(target: "relay", %sender, "dropping frame: {e}");
                return;
            }
        };

        self.handle_client_message(message, sender, now);
    }

    fn handle_client_message(&mut self, message: ClientMessage, sender: ClientId, now: Instant) {
        let result = match &message {
            ClientMessage::Allocate(request) => self.handle_allocate_request(request, sender, now),
            ClientMessage::Refresh(request) => self.handle_refresh_request(request, sender, now),
            ClientMessage::ChannelBind(request) => {
                self.handle_channel_bind_request(request, sender, now)
            }
            ClientMessage::CreatePermission(request) => {
                self.handle_create_permission_request(request, sender, now)
            }
            ClientMessage::Binding(request) => {
                self.handle_binding_request(request, sender);
                return;
            }
            ClientMessage::Send(indication) => {
                self.handle_send_indication(indication, sender, now);
                return;
            }
            ClientMessage::ChannelData(frame) => {
                self.handle_channel_data(frame, sender, now);
                return;
            }
        };

        let Err(mut error_response) = result else {
            return;
        };

        let is_auth_error = error_response
            .get_attribute::<ErrorCode>()
            .is_some_and(|error_code| {
                error_code == &ErrorCode::from(Unauthorized)
                    || error_code == &ErrorCode::from(StaleNonce)
            });

        // 401 and 438 responses challenge the client with a realm and nonce.
        if is_auth_error {
            error_response.add_attribute((*REALM).clone());
            error_response.add_attribute(self.new_nonce_attribute());
        }

        match message.username() {
            Some(username) => {
                match AuthenticatedMessage::new(&self.turn_secret, username, error_response) {
                    Ok(message) => self.send_authenticated(message, sender),
                    Err(e) => {
                        tracing::warn!(target: "relay", "failed to create error response: {e}")
                    }
                }
            }
            None => self.send_unauthenticated(error_response, sender),
        }
    }

    /// Sweeps everything whose lifetime ran out.
    ///
    /// All expiry state lives directly on the allocations and channels, so
    /// the sweep just walks them: expired allocations die wholesale, bound
    /// channels past their lifetime turn unbound (the number stays reserved
    /// for the rebind cooldown), cooled-down unbound channels are deleted,
    /// and lapsed permissions vanish.
    pub fn handle_deadline_reached(&mut self, now: Instant) {
        let expired = self
            .allocations
            .iter()
            .filter(|(_, allocation)| allocation.is_expired(now))
            .map(|(client, _)| *client)
            .collect::<Vec<_>>();

        for client in expired {
            self.delete_allocation(client);
        }

        let mut newly_unbound = Vec::new();
        let mut deletable = Vec::new();

        for ((client, number), channel) in &self.channels {
            if channel.bound && channel.is_expired(now) {
                newly_unbound.push((*client, *number));
            } else if !channel.bound && channel.expiry + CHANNEL_REBIND_TIMEOUT <= now {
                deletable.push((*client, *number));
            }
        }

        for (client, number) in newly_unbound {
            let Some(channel) = self.channels.get_mut(&(client, number)) else {
                continue;
            };

            tracing::info!(target: "relay", %client, channel = %number, "channel binding expired");

            channel.bound = false;
            self.channel_numbers_by_client_and_peer
                .remove(&(client, channel.peer_relay_addr));
        }

        for key in deletable {
            self.channels.remove(&key);
        }

        for allocation in self.allocations.values_mut() {
            allocation.permissions.retain(|_, expiry| *expiry > now);
        }

        self.arm_wake();
    }

    /// Return the next command to be executed.
    pub fn next_command(&mut self) -> Option<Command> {
        self.pending_commands.pop_front()
    }

    fn handle_binding_request(&mut self, request: &Binding, sender: ClientId) {
        let observed = self
            .observed_addresses
            .get(&sender)
            .copied()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

        let mut message = success_response(BINDING, request.transaction_id());
        message.add_attribute(XorMappedAddress::new(observed));

        self.send_unauthenticated(message, sender);
    }

    /// Handle a TURN allocate request.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc8656#name-receiving-an-allocate-reque>.
    fn handle_allocate_request(
        &mut self,
        request: &Allocate,
        sender: ClientId,
        now: Instant,
    ) -> Result<(), Message<Attribute>> {
        let username = self.verify_auth(request)?;

        if let Some(allocation) = self.allocations.get(&sender) {
            tracing::debug!(target: "relay", relay_addr = %allocation.relay_addr, %sender, "client already has an allocation");

            return Err(error_response(AllocationMismatch, request));
        }

        if self.clients_by_relay_addr.len() as u32 >= MAX_AVAILABLE_ADDRESSES {
            tracing::warn!(target: "relay", %sender, "no more relay addresses available");

            return Err(error_response(InsufficientCapacity, request));
        }

        if request.requested_transport().protocol() != UDP_TRANSPORT {
            return Err(error_response(BadRequest, request));
        }

        let effective_lifetime = request.effective_lifetime();
        let relay_addr = self.next_relay_addr();

        let allocation = Allocation {
            relay_addr,
            expires_at: now + effective_lifetime.lifetime(),
            permissions: HashMap::new(),
        };

        let mut message = success_response(ALLOCATE, request.transaction_id());
        message.add_attribute(XorRelayAddress::new(relay_addr));
        message.add_attribute(XorMappedAddress::new(
            self.observed_addresses
                .get(&sender)
                .copied()
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
        ));
        message.add_attribute(effective_lifetime.clone());

        self.clients_by_relay_addr.insert(relay_addr, sender);
        self.allocations.insert(sender, allocation);
        self.arm_wake();

        self.authenticate_and_send(&username, request, message, sender);

        tracing::info!(
            target: "relay",
            %sender,
            %relay_addr,
            lifetime = ?effective_lifetime.lifetime(),
            "created new allocation",
        );

        Ok(())
    }

    /// Handle a TURN refresh request.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc8656#name-receiving-a-refresh-request>.
    fn handle_refresh_request(
        &mut self,
        request: &Refresh,
        sender: ClientId,
        now: Instant,
    ) -> Result<(), Message<Attribute>> {
        let username = self.verify_auth(request)?;

        let Some(allocation) = self.allocations.get_mut(&sender) else {
            tracing::debug!(target: "relay", %sender, "refresh from client without an allocation");

            return Err(error_response(AllocationMismatch, request));
        };

        let effective_lifetime = request.effective_lifetime();

        if effective_lifetime.lifetime().is_zero() {
            self.delete_allocation(sender);
            self.authenticate_and_send(
                &username,
                request,
                refresh_success_response(effective_lifetime, request.transaction_id()),
                sender,
            );

            return Ok(());
        }

        allocation.expires_at = now + effective_lifetime.lifetime();

        tracing::info!(target: "relay", relay_addr = %allocation.relay_addr, %sender, "refreshed allocation");

        self.arm_wake();
        self.authenticate_and_send(
            &username,
            request,
            refresh_success_response(effective_lifetime, request.transaction_id()),
            sender,
        );

        Ok(())
    }

    /// Handle a TURN channel bind request.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc8656#name-receiving-a-channelbind-req>.
    fn handle_channel_bind_request(
        &mut self,
        request: &ChannelBind,
        sender: ClientId,
        now: Instant,
    ) -> Result<(), Message<Attribute>> {
        let username = self.verify_auth(request)?;

        if !self.allocations.contains_key(&sender) {
            tracing::debug!(target: "relay", %sender, "channel bind from client without an allocation");

            return Err(error_response(AllocationMismatch, request));
        }

        let requested_channel = request.channel_number().value();
        let peer_address = request.xor_peer_address().address();

        if !CHANNEL_NUMBER_RANGE.contains(&requested_channel) || !peer_address.is_ipv4() {
            return Err(error_response(BadRequest, request));
        }

        // Ensure the same peer isn't already bound to a different channel.
        if let Some(number) = self
            .channel_numbers_by_client_and_peer
            .get(&(sender, peer_address))
        {
            if number != &requested_channel {
                tracing::debug!(target: "relay", existing_channel = %number, peer = %peer_address, channel = %requested_channel, "peer is already bound to another channel");

                return Err(error_response(BadRequest, request));
            }
        }

        let is_rebind_to_other_peer = self
            .channels
            .get(&(sender, requested_channel))
            .is_some_and(|channel| channel.peer_relay_addr != peer_address);

        if is_rebind_to_other_peer {
            tracing::debug!(target: "relay", peer = %peer_address, channel = %requested_channel, "channel is already bound to a different peer");

            return Err(error_response(BadRequest, request));
        }

        // A bind always installs the peer permission as well.
        if let Some(allocation) = self.allocations.get_mut(&sender) {
            allocation.grant_permission(peer_address.ip(), now);
        }

        if let Some(channel) = self.channels.get_mut(&(sender, requested_channel)) {
            // Binding requests for existing channels refresh the binding.
            channel.refresh(now);
            channel.bound = true;
            self.channel_numbers_by_client_and_peer
                .insert((sender, peer_address), requested_channel);

            self.arm_wake();

            tracing::info!(target: "relay", %sender, peer = %peer_address, channel = %requested_channel, "refreshed channel binding");

            self.authenticate_and_send(
                &username,
                request,
                channel_bind_success_response(request.transaction_id()),
                sender,
            );

            return Ok(());
        }

        let channel = Channel {
            expiry: now + CHANNEL_BINDING_DURATION,
            peer_relay_addr: peer_address,
            bound: true,
        };

        self.channels.insert((sender, requested_channel), channel);
        self.channel_numbers_by_client_and_peer
            .insert((sender, peer_address), requested_channel);
        self.arm_wake();

        tracing::info!(target: "relay", %sender, peer = %peer_address, channel = %requested_channel, "bound channel");

        self.authenticate_and_send(
            &username,
            request,
            channel_bind_success_response(request.transaction_id()),
            sender,
        );

        Ok(())
    }

    /// Handle a TURN create permission request.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc8656#name-receiving-a-createpermissio>.
    fn handle_create_permission_request(
        &mut self,
        request: &CreatePermission,
        sender: ClientId,
        now: Instant,
    ) -> Result<(), Message<Attribute>> {
        let username = self.verify_auth(request)?;

        let Some(allocation) = self.allocations.get_mut(&sender) else {
            return Err(error_response(AllocationMismatch, request));
        };

        for peer in request.xor_peer_addresses() {
            allocation.grant_permission(peer.address().ip(), now);
        }
        self.arm_wake();

        self.authenticate_and_send(
            &username,
            request,
            create_permission_success_response(request.transaction_id()),
            sender,
        );

        Ok(())
    }

    /// Datagram from `sender` towards a peer's relay address.
    fn handle_send_indication(&mut self, indication: &Send, sender: ClientId, now: Instant) {
        let peer_relay_addr = indication.peer();

        let Some(allocation) = self.allocations.get(&sender) else {
            tracing::debug!(target: "relay", %sender, "send indication from client without an allocation");
            return;
        };

        if !allocation.has_permission(peer_relay_addr.ip(), now) {
            tracing::debug!(target: "relay", %sender, peer = %peer_relay_addr, "no permission for peer, dropping");
            return;
        }

        let sender_relay_addr = allocation.relay_addr;

        self.forward(sender_relay_addr, peer_relay_addr, indication.data(), now);
    }

    /// ChannelData frame from `sender` on one of its channels.
    fn handle_channel_data(&mut self, frame: &ChannelData, sender: ClientId, now: Instant) {
        let Some(channel) = self.channels.get(&(sender, frame.channel())) else {
            tracing::debug!(target: "relay", %sender, channel = %frame.channel(), "data on unbound channel");
            return;
        };

        if !channel.bound {
            tracing::debug!(target: "relay", %sender, channel = %frame.channel(), "channel exists but is unbound");
            return;
        }

        let peer_relay_addr = channel.peer_relay_addr;

        let Some(allocation) = self.allocations.get(&sender) else {
            return;
        };
        let sender_relay_addr = allocation.relay_addr;

        self.forward(sender_relay_addr, peer_relay_addr, frame.data(), now);
    }

    /// Delivers `data` from one allocation to another.
    ///
    /// If the target client has a channel bound to the sender's relay
    /// address, the data goes out as a ChannelData frame; otherwise as a
    /// Data indication. A target without a matching permission drops the
    /// data silently.
    fn forward(&mut self, from: RelayAddr, to: RelayAddr, data: &[u8], now: Instant) {
        let Some(target_client) = self.clients_by_relay_addr.get(&to).copied() else {
            tracing::debug!(target: "relay", %to, "no allocation behind relay address, dropping");
            return;
        };

        if let Some(number) = self
            .channel_numbers_by_client_and_peer
            .get(&(target_client, from))
        {
            self.pending_commands.push_back(Command::SendFrame {
                payload: channel_data::make(*number, data),
                recipient: target_client,
            });
            return;
        }

        let Some(target_allocation) = self.allocations.get(&target_client) else {
            return;
        };

        if !target_allocation.has_permission(from.ip(), now) {
            tracing::debug!(target: "relay", %from, %to, "target has no permission for sender, dropping");
            return;
        }

        let mut message = Message::new(
            MessageClass::Indication,
            DATA,
            TransactionId::new(rand::random()),
        );
        message.add_attribute(XorPeerAddress::new(from));

        let Ok(data) = Data::new(data.to_vec()) else {
            tracing::debug!(target: "relay", "payload too large for DATA attribute, dropping");
            return;
        };
        message.add_attribute(data);

        self.send_indication(message, target_client);
    }

    fn verify_auth(
        &mut self,
        request: &(impl StunRequest + ProtectedRequest),
    ) -> Result<Username, Message<Attribute>> {
        let message_integrity = request
            .message_integrity()
            .ok_or_else(|| error_response(Unauthorized, request))?;
        let username = request
            .username()
            .ok_or_else(|| error_response(Unauthorized, request))?;
        let nonce = request
            .nonce()
            .ok_or_else(|| error_response(Unauthorized, request))?
            .value()
            .parse::<Uuid>()
            .map_err(|_| error_response(Unauthorized, request))?;

        if !self.nonces.spend(nonce) {
            return Err(error_response(StaleNonce, request));
        }

        message_integrity
            .verify(&self.turn_secret, username.name(), SystemTime::now())
            .map_err(|e| {
                tracing::debug!(target: "relay", "message integrity check failed: {e}");

                error_response(Unauthorized, request)
            })?;

        Ok(username.clone())
    }

    fn next_relay_addr(&mut self) -> RelayAddr {
        loop {
            let i = self.next_relay_index;
            self.next_relay_index = self.next_relay_index.wrapping_add(1);

            let ip = Ipv4Addr::new(
                RELAY_NET[0],
                RELAY_NET[1],
                ((i >> 8) & 0xFF) as u8,
                (i & 0xFF) as u8,
            );
            let port = LOWEST_RELAY_PORT + (i % (u16::MAX - LOWEST_RELAY_PORT) as u32) as u16;
            let candidate = SocketAddr::from((ip, port));

            if !self.clients_by_relay_addr.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn new_nonce_attribute(&mut self) -> Nonce {
        let nonce = self.nonces.mint();

        Nonce::new(nonce.as_hyphenated().to_string()).expect("UUIDs are less than 128 chars")
    }

    /// The earliest moment anything on the server expires.
    fn next_wake(&self) -> Option<Instant> {
        let allocations = self.allocations.values().map(|a| a.expires_at);
        let channels = self.channels.values().map(|c| {
            if c.bound {
                c.expiry
            } else {
                c.expiry + CHANNEL_REBIND_TIMEOUT
            }
        });
        let permissions = self
            .allocations
            .values()
            .flat_map(|a| a.permissions.values().copied());

        allocations.chain(channels).chain(permissions).min()
    }

    fn arm_wake(&mut self) {
        if let Some(deadline) = self.next_wake() {
            self.pending_commands.push_back(Command::Wake { deadline });
        }
    }

    fn authenticate_and_send(
        &mut self,
        username: &Username,
        request: &impl StunRequest,
        message: Message<Attribute>,
        recipient: ClientId,
    ) {
        let authenticated = match AuthenticatedMessage::new(&self.turn_secret, username, message) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(target: "relay", "failed to authenticate response: {e}");

                let mut error_response = Message::new(
                    MessageClass::ErrorResponse,
                    request.method(),
                    request.transaction_id(),
                );
                error_response.add_attribute(ErrorCode::from(ServerError));

                self.send_unauthenticated(error_response, recipient);
                return;
            }
        };

        self.send_authenticated(authenticated, recipient);
    }

    fn send_authenticated(&mut self, message: AuthenticatedMessage, recipient: ClientId) {
        tracing::trace!(target: "wire::turn", method = %message.method().as_u16(), class = ?message.class(), %recipient, "sending message");

        let Ok(bytes) = message.encode() else {
            debug_assert!(false, "encoding should never fail");
            return;
        };

        self.pending_commands.push_back(Command::SendFrame {
            payload: append_fingerprint(bytes),
            recipient,
        });
    }

    fn send_unauthenticated(&mut self, message: Message<Attribute>, recipient: ClientId) {
        let Ok(bytes) = stun_codec::MessageEncoder::default().encode_into_bytes(message) else {
            debug_assert!(false, "encoding should never fail");
            return;
        };

        self.pending_commands.push_back(Command::SendFrame {
            payload: append_fingerprint(bytes),
            recipient,
        });
    }

    /// Indications carry neither MESSAGE-INTEGRITY nor FINGERPRINT.
    fn send_indication(&mut self, message: Message<Attribute>, recipient: ClientId) {
        let Ok(bytes) = stun_codec::MessageEncoder::default().encode_into_bytes(message) else {
            debug_assert!(false, "encoding should never fail");
            return;
        };

        self.pending_commands.push_back(Command::SendFrame {
            payload: bytes,
            recipient,
        });
    }

    fn delete_allocation(&mut self, client: ClientId) {
        let Some(allocation) = self.allocations.remove(&client) else {
            return;
        };

        self.clients_by_relay_addr.remove(&allocation.relay_addr);

        let channels_of_client = self
            .channels
            .range((client, 0)..=(client, u16::MAX))
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();

        for key in channels_of_client {
            if let Some(channel) = self.channels.remove(&key) {
                self.channel_numbers_by_client_and_peer
                    .remove(&(client, channel.peer_relay_addr));
            }
        }

        tracing::info!(target: "relay", %client, relay_addr = %allocation.relay_addr, "deleted allocation");
    }
}

/// Represents the allocation of one client.
struct Allocation {
    relay_addr: RelayAddr,
    expires_at: Instant,
    /// Peer IPs this client may exchange data with, each with its expiry.
    permissions: HashMap<IpAddr, Instant>,
}

impl Allocation {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    fn grant_permission(&mut self, ip: IpAddr, now: Instant) {
        self.permissions.insert(ip, now + PERMISSION_DURATION);
    }

    fn has_permission(&self, ip: IpAddr, now: Instant) -> bool {
        self.permissions.get(&ip).is_some_and(|expiry| *expiry > now)
    }
}

struct Channel {
    expiry: Instant,
    peer_relay_addr: RelayAddr,

    /// Whether the channel is currently bound.
    ///
    /// Expired channels stay around unbound for another five minutes so the
    /// number cannot be re-bound to a different peer in the meantime.
    bound: bool,
}

impl Channel {
    fn refresh(&mut self, now: Instant) {
        self.expiry = now + CHANNEL_BINDING_DURATION;
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expiry <= now
    }
}

fn success_response(method: Method, transaction_id: TransactionId) -> Message<Attribute> {
    let mut message = Message::new(MessageClass::SuccessResponse, method, transaction_id);
    message.add_attribute((*SOFTWARE).clone());

    message
}

fn refresh_success_response(
    effective_lifetime: Lifetime,
    transaction_id: TransactionId,
) -> Message<Attribute> {
    let mut message = success_response(REFRESH, transaction_id);
    message.add_attribute(effective_lifetime);

    message
}

fn channel_bind_success_response(transaction_id: TransactionId) -> Message<Attribute> {
    success_response(CHANNEL_BIND, transaction_id)
}

fn create_permission_success_response(transaction_id: TransactionId) -> Message<Attribute> {
    success_response(CREATE_PERMISSION, transaction_id)
}

fn error_response(
    error: impl Into<ErrorCode>,
    request: &impl StunRequest,
) -> Message<Attribute> {
    let mut message = Message::new(
        MessageClass::ErrorResponse,
        request.method(),
        request.transaction_id(),
    );
    message.add_attribute((*SOFTWARE).clone());
    message.add_attribute(error.into());

    message
}

/// Outstanding nonces and how much request budget each has left.
///
/// A nonce is handed out with every auth challenge and covers a fixed
/// number of requests; once the budget is spent the client gets a 438 with
/// a fresh nonce and carries on. Count-based invalidation keeps the relay
/// free of per-nonce clocks.
#[derive(Default)]
struct NonceBook {
    budgets: HashMap<Uuid, u32>,
}

impl NonceBook {
    const REQUESTS_PER_NONCE: u32 = 100;

    /// Issues a nonce with a full budget.
    fn mint(&mut self) -> Uuid {
        let nonce = Uuid::new_v4();
        self.budgets.insert(nonce, Self::REQUESTS_PER_NONCE);

        nonce
    }

    /// Spends one request from the nonce's budget.
    ///
    /// Returns `false` for unknown or used-up nonces; the caller challenges
    /// the client again.
    fn spend(&mut self, nonce: Uuid) -> bool {
        let Some(budget) = self.budgets.get_mut(&nonce) else {
            return false;
        };

        if *budget == 0 {
            self.budgets.remove(&nonce);
            return false;
        }

        *budget -= 1;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_budget_covers_exactly_its_request_count() {
        let mut nonces = NonceBook::default();
        let nonce = nonces.mint();

        for _ in 0..NonceBook::REQUESTS_PER_NONCE {
            assert!(nonces.spend(nonce));
        }

        assert!(!nonces.spend(nonce), "budget must be exhausted");
        assert!(!nonces.spend(nonce), "an exhausted nonce stays dead");
    }

    #[test]
    fn nonces_we_never_minted_are_rejected() {
        let mut nonces = NonceBook::default();

        assert!(!nonces.spend(Uuid::new_v4()));
    }

    #[test]
    fn each_mint_is_independent() {
        let mut nonces = NonceBook::default();
        let first = nonces.mint();
        let second = nonces.mint();

        assert_ne!(first, second);

        for _ in 0..NonceBook::REQUESTS_PER_NONCE {
            assert!(nonces.spend(first));
        }

        assert!(!nonces.spend(first));
        assert!(nonces.spend(second), "other nonces keep their own budget");
    }
}
