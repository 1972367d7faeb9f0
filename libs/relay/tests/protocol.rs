//! Behavioural tests for the relay server, driven through the same byte
//! frames a WebSocket-attached client would send.

use bamgate_relay::auth::{generate_password, make_credentials};
use bamgate_relay::{
    append_fingerprint, channel_data, Attribute, ClientId, Command, Server, REALM,
};
use bytecodec::{DecodeExt, EncodeExt};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};
use stun_codec::rfc5389::attributes::{
    ErrorCode, MessageIntegrity, Nonce, Realm, Username, XorMappedAddress,
};
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5766::attributes::{
    ChannelNumber, Data, Lifetime, RequestedTransport, XorPeerAddress, XorRelayAddress,
};
use stun_codec::rfc5766::methods::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH, SEND};
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};

const SECRET: &str = "9b13b1d09a4da614d7b8f7d92aab83f2";

struct TestClient {
    id: ClientId,
    username: Username,
    nonce: Option<Nonce>,
    next_tid: u8,
}

impl TestClient {
    fn new(id: u64, peer_id: &str) -> Self {
        let (username, _) = make_credentials(
            &secret(),
            peer_id,
            Duration::from_secs(3600),
            SystemTime::now(),
        );

        Self {
            id: ClientId(id),
            username: Username::new(username).unwrap(),
            nonce: None,
            next_tid: 0,
        }
    }

    fn tid(&mut self) -> TransactionId {
        self.next_tid += 1;
        TransactionId::new([self.next_tid; 12])
    }

    fn authed_request(
        &mut self,
        method: stun_codec::Method,
        attributes: Vec<Attribute>,
    ) -> Vec<u8> {
        let mut message = Message::<Attribute>::new(MessageClass::Request, method, self.tid());
        message.add_attribute(self.username.clone());
        message.add_attribute((*REALM).clone());
        message.add_attribute(self.nonce.clone().expect("challenge first"));
        for attribute in attributes {
            message.add_attribute(attribute);
        }

        let password = generate_password(&secret(), self.username.name());
        let mi =
            MessageIntegrity::new_long_term_credential(&message, &self.username, &REALM, &password)
                .unwrap();
        message.add_attribute(mi);

        append_fingerprint(encode(message))
    }

    /// Runs the two-phase dance up to a successful allocation and returns
    /// the XOR-RELAYED-ADDRESS.
    fn allocate(&mut self, server: &mut Server, now: Instant) -> SocketAddr {
        // Phase 1: no credentials.
        let mut unauthenticated =
            Message::<Attribute>::new(MessageClass::Request, ALLOCATE, self.tid());
        unauthenticated.add_attribute(RequestedTransport::new(17));

        server.handle_client_input(&encode(unauthenticated), self.id, now);

        let challenge = next_message_to(server, self.id);
        assert_eq!(challenge.class(), MessageClass::ErrorResponse);
        assert_eq!(
            challenge.get_attribute::<ErrorCode>().unwrap().code(),
            401,
            "phase-1 allocate must be challenged"
        );
        assert!(challenge.get_attribute::<Realm>().is_some());

        self.nonce = Some(challenge.get_attribute::<Nonce>().unwrap().clone());

        // Phase 2: authenticated.
        let frame = self.authed_request(
            ALLOCATE,
            vec![RequestedTransport::new(17).into()],
        );
        server.handle_client_input(&frame, self.id, now);

        let response = next_message_to(server, self.id);
        assert_eq!(response.class(), MessageClass::SuccessResponse);
        assert!(
            response
                .get_attribute::<Lifetime>()
                .is_some_and(|l| l.lifetime() > Duration::ZERO),
            "allocation must carry a positive LIFETIME"
        );

        response
            .get_attribute::<XorRelayAddress>()
            .expect("success must carry XOR-RELAYED-ADDRESS")
            .address()
    }
}

fn secret() -> SecretString {
    SecretString::from(SECRET)
}

fn encode(message: Message<Attribute>) -> Vec<u8> {
    MessageEncoder::default().encode_into_bytes(message).unwrap()
}

fn decode(bytes: &[u8]) -> Message<Attribute> {
    let stripped = bamgate_relay::strip_fingerprint(bytes).unwrap();

    MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&stripped)
        .unwrap()
        .unwrap()
}

fn next_frame_to(server: &mut Server, recipient: ClientId) -> Vec<u8> {
    loop {
        match server.next_command() {
            Some(Command::SendFrame {
                payload,
                recipient: r,
            }) if r == recipient => return payload,
            Some(_) => continue,
            None => panic!("no pending frame for {recipient:?}"),
        }
    }
}

fn next_message_to(server: &mut Server, recipient: ClientId) -> Message<Attribute> {
    decode(&next_frame_to(server, recipient))
}

fn new_server() -> Server {
    let mut server = Server::new(secret());
    server.client_connected(ClientId(1), "192.0.2.1:41000".parse().unwrap());
    server.client_connected(ClientId(2), "192.0.2.2:42000".parse().unwrap());
    server
}

#[test]
fn two_phase_allocate_yields_virtual_relay_address() {
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    let relay_addr = client.allocate(&mut server, Instant::now());

    match relay_addr.ip() {
        std::net::IpAddr::V4(ip) => {
            assert_eq!(ip.octets()[..2], [10, 255], "relay addresses live in 10.255.0.0/16")
        }
        std::net::IpAddr::V6(_) => panic!("relay addresses are IPv4"),
    }
    assert!(relay_addr.port() >= 50_000);
}

#[test]
fn second_allocate_on_same_connection_is_437() {
    let now = Instant::now();
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    client.allocate(&mut server, now);

    let frame = client.authed_request(ALLOCATE, vec![RequestedTransport::new(17).into()]);
    server.handle_client_input(&frame, client.id, now);

    let response = next_message_to(&mut server, client.id);
    assert_eq!(response.class(), MessageClass::ErrorResponse);
    assert_eq!(response.get_attribute::<ErrorCode>().unwrap().code(), 437);
}

#[test]
fn refresh_with_zero_lifetime_deallocates() {
    let now = Instant::now();
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    client.allocate(&mut server, now);
    assert_eq!(server.num_allocations(), 1);

    let frame = client.authed_request(
        REFRESH,
        vec![Lifetime::new(Duration::ZERO).unwrap().into()],
    );
    server.handle_client_input(&frame, client.id, now);

    let response = next_message_to(&mut server, client.id);
    assert_eq!(response.class(), MessageClass::SuccessResponse);
    assert_eq!(server.num_allocations(), 0);
}

#[test]
fn expired_allocation_is_reaped_on_deadline() {
    let now = Instant::now();
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    client.allocate(&mut server, now);

    server.handle_deadline_reached(now + Duration::from_secs(601));

    assert_eq!(server.num_allocations(), 0);
}

#[test]
fn rebinding_channel_to_other_peer_is_400() {
    let now = Instant::now();
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    client.allocate(&mut server, now);

    let peer_1: SocketAddr = "10.255.0.9:50009".parse().unwrap();
    let peer_2: SocketAddr = "10.255.0.8:50008".parse().unwrap();

    let frame = client.authed_request(
        CHANNEL_BIND,
        vec![
            ChannelNumber::new(0x4000).unwrap().into(),
            XorPeerAddress::new(peer_1).into(),
        ],
    );
    server.handle_client_input(&frame, client.id, now);
    assert_eq!(
        next_message_to(&mut server, client.id).class(),
        MessageClass::SuccessResponse
    );

    let frame = client.authed_request(
        CHANNEL_BIND,
        vec![
            ChannelNumber::new(0x4000).unwrap().into(),
            XorPeerAddress::new(peer_2).into(),
        ],
    );
    server.handle_client_input(&frame, client.id, now);

    let response = next_message_to(&mut server, client.id);
    assert_eq!(response.class(), MessageClass::ErrorResponse);
    assert_eq!(response.get_attribute::<ErrorCode>().unwrap().code(), 400);
}

#[test]
fn data_is_forwarded_between_allocations_as_channel_data() {
    let now = Instant::now();
    let mut server = new_server();
    let mut alice = TestClient::new(1, "device-a");
    let mut bob = TestClient::new(2, "device-b");

    let alice_relay = alice.allocate(&mut server, now);
    let bob_relay = bob.allocate(&mut server, now);

    // Both sides bind a channel towards the other's relay address.
    let frame = alice.authed_request(
        CHANNEL_BIND,
        vec![
            ChannelNumber::new(0x4000).unwrap().into(),
            XorPeerAddress::new(bob_relay).into(),
        ],
    );
    server.handle_client_input(&frame, alice.id, now);
    next_frame_to(&mut server, alice.id);

    let frame = bob.authed_request(
        CHANNEL_BIND,
        vec![
            ChannelNumber::new(0x4001).unwrap().into(),
            XorPeerAddress::new(alice_relay).into(),
        ],
    );
    server.handle_client_input(&frame, bob.id, now);
    next_frame_to(&mut server, bob.id);

    // Alice sends on her channel; Bob must receive ChannelData on his.
    let frame = channel_data::make(0x4000, b"hello bob");
    server.handle_client_input(&frame, alice.id, now);

    let forwarded = next_frame_to(&mut server, bob.id);
    assert_eq!(u16::from_be_bytes([forwarded[0], forwarded[1]]), 0x4001);
    assert_eq!(&forwarded[4..4 + 9], b"hello bob");
}

#[test]
fn send_indication_falls_back_to_data_indication() {
    let now = Instant::now();
    let mut server = new_server();
    let mut alice = TestClient::new(1, "device-a");
    let mut bob = TestClient::new(2, "device-b");

    let alice_relay = alice.allocate(&mut server, now);
    let bob_relay = bob.allocate(&mut server, now);

    // Alice grants herself permission towards Bob, Bob towards Alice,
    // but neither binds a channel.
    let frame = alice.authed_request(
        CREATE_PERMISSION,
        vec![XorPeerAddress::new(bob_relay).into()],
    );
    server.handle_client_input(&frame, alice.id, now);
    next_frame_to(&mut server, alice.id);

    let frame = bob.authed_request(
        CREATE_PERMISSION,
        vec![XorPeerAddress::new(alice_relay).into()],
    );
    server.handle_client_input(&frame, bob.id, now);
    next_frame_to(&mut server, bob.id);

    let mut send = Message::<Attribute>::new(
        MessageClass::Indication,
        SEND,
        TransactionId::new([7u8; 12]),
    );
    send.add_attribute(XorPeerAddress::new(bob_relay));
    send.add_attribute(Data::new(b"ping".to_vec()).unwrap());

    server.handle_client_input(&encode(send), alice.id, now);

    let forwarded = next_frame_to(&mut server, bob.id);
    let message = MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&forwarded)
        .unwrap()
        .unwrap();

    assert_eq!(message.class(), MessageClass::Indication);
    assert_eq!(message.method(), DATA);
    assert_eq!(
        message.get_attribute::<XorPeerAddress>().unwrap().address(),
        alice_relay,
        "data indications carry the sender's relay address"
    );
    assert_eq!(message.get_attribute::<Data>().unwrap().data(), b"ping");
}

#[test]
fn send_without_target_permission_is_dropped() {
    let now = Instant::now();
    let mut server = new_server();
    let mut alice = TestClient::new(1, "device-a");
    let mut bob = TestClient::new(2, "device-b");

    let alice_relay = alice.allocate(&mut server, now);
    let bob_relay = bob.allocate(&mut server, now);
    let _ = alice_relay;

    // Only Alice grants a permission; Bob does not.
    let frame = alice.authed_request(
        CREATE_PERMISSION,
        vec![XorPeerAddress::new(bob_relay).into()],
    );
    server.handle_client_input(&frame, alice.id, now);
    next_frame_to(&mut server, alice.id);

    let mut send = Message::<Attribute>::new(
        MessageClass::Indication,
        SEND,
        TransactionId::new([9u8; 12]),
    );
    send.add_attribute(XorPeerAddress::new(bob_relay));
    send.add_attribute(Data::new(b"ping".to_vec()).unwrap());

    server.handle_client_input(&encode(send), alice.id, now);

    assert!(server.next_command().is_none(), "frame must be dropped");
}

#[test]
fn disconnect_destroys_allocation() {
    let now = Instant::now();
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    client.allocate(&mut server, now);
    assert_eq!(server.num_allocations(), 1);

    server.client_disconnected(client.id);
    assert_eq!(server.num_allocations(), 0);
}

#[test]
fn relay_addresses_are_unique_across_live_allocations() {
    let now = Instant::now();
    let mut server = new_server();
    let mut alice = TestClient::new(1, "device-a");
    let mut bob = TestClient::new(2, "device-b");

    let a = alice.allocate(&mut server, now);
    let b = bob.allocate(&mut server, now);

    assert_ne!(a, b);
}

#[test]
fn binding_request_reports_observed_address() {
    let mut server = new_server();

    let request = Message::<Attribute>::new(
        MessageClass::Request,
        BINDING,
        TransactionId::new([3u8; 12]),
    );
    server.handle_client_input(&encode(request), ClientId(1), Instant::now());

    let response = next_message_to(&mut server, ClientId(1));
    assert_eq!(response.class(), MessageClass::SuccessResponse);
    assert_eq!(
        response
            .get_attribute::<XorMappedAddress>()
            .unwrap()
            .address(),
        "192.0.2.1:41000".parse::<SocketAddr>().unwrap()
    );
}

#[test]
fn stale_nonce_is_438() {
    let now = Instant::now();
    let mut server = new_server();
    let mut client = TestClient::new(1, "device-a");

    client.allocate(&mut server, now);

    // Burn through the nonce's request budget.
    for _ in 0..100 {
        let frame = client.authed_request(REFRESH, vec![]);
        server.handle_client_input(&frame, client.id, now);
        next_frame_to(&mut server, client.id);
    }

    let frame = client.authed_request(REFRESH, vec![]);
    server.handle_client_input(&frame, client.id, now);

    let response = next_message_to(&mut server, client.id);
    assert_eq!(response.class(), MessageClass::ErrorResponse);
    assert_eq!(response.get_attribute::<ErrorCode>().unwrap().code(), 438);
    // The 438 hands out a fresh nonce to continue with.
    assert!(response.get_attribute::<Nonce>().is_some());
}
