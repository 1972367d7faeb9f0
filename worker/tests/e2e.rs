//! End-to-end tests over a listening worker: REST registration, signaling
//! rooms with real WebSocket clients and the TURN endpoint.

use bamgate_worker::hub::Rooms;
use bamgate_worker::registry::{AcceptNonEmpty, Registry};
use bamgate_worker::turn::TurnGateway;
use bamgate_worker::{app, AppState};
use futures::{future, SinkExt, StreamExt};
use secrecy::SecretString;
use signaling::{Event, Message, SignalingChannel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_worker() -> SocketAddr {
    let state = AppState {
        registry: Arc::new(Registry::new(
            "100.64.0.0/24".parse().unwrap(),
            &SecretString::from("test-jwt-secret"),
            SecretString::from("test-turn-secret"),
            Box::new(AcceptNonEmpty),
        )),
        rooms: Arc::new(Rooms::new()),
        turn: Arc::new(TurnGateway::new(SecretString::from("test-turn-secret"))),
        server_url: "http://worker.test".to_owned(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

#[derive(serde::Deserialize)]
struct Registered {
    device_id: String,
    access_token: String,
    refresh_token: String,
    address: String,
    subnet: String,
    turn_secret: String,
}

async fn register(addr: SocketAddr, name: &str) -> Registered {
    reqwest::Client::new()
        .post(format!("http://{addr}/auth/register"))
        .json(&serde_json::json!({"github_token": "gh-token", "device_name": name}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn join_for(device: &Registered) -> Message {
    Message::Join {
        peer_id: device.device_id.clone(),
        public_key: format!("pk-{}", device.device_id),
        address: format!("{}/24", device.address),
        routes: vec!["192.168.10.0/24".to_owned()],
        dns: vec![],
        dns_search: vec![],
    }
}

fn channel_for(addr: SocketAddr, device: &Registered) -> SignalingChannel {
    let mut channel = SignalingChannel::disconnected(
        &Url::parse(&format!("http://{addr}")).unwrap(),
        SecretString::from(device.access_token.clone()),
        join_for(device),
        SignalingChannel::default_backoff,
    )
    .unwrap();

    channel.connect();

    channel
}

async fn next_event(channel: &mut SignalingChannel) -> Event {
    tokio::time::timeout(TIMEOUT, future::poll_fn(|cx| channel.poll(cx)))
        .await
        .expect("timed out waiting for signaling event")
        .expect("signaling channel failed")
}

/// Drives the channel until a message matching `predicate` arrives.
async fn wait_for_message(
    channel: &mut SignalingChannel,
    predicate: impl Fn(&Message) -> bool,
) -> Message {
    loop {
        if let Event::Inbound(message) = next_event(channel).await {
            if predicate(&message) {
                return message;
            }
        }
    }
}

#[tokio::test]
async fn registration_hands_out_network_parameters() {
    let addr = spawn_worker().await;

    let device = register(addr, "laptop").await;

    assert!(!device.device_id.is_empty());
    assert!(!device.refresh_token.is_empty());
    assert_eq!(device.subnet, "100.64.0.0/24");
    assert_eq!(device.turn_secret, "test-turn-secret");
    assert!(device.address.starts_with("100.64.0."));
}

#[tokio::test]
async fn two_peers_discover_each_other_and_exchange_sdp() {
    let addr = spawn_worker().await;

    let alice = register(addr, "alice").await;
    let bob = register(addr, "bob").await;

    let mut alice_channel = channel_for(addr, &alice);

    assert!(matches!(next_event(&mut alice_channel).await, Event::Connected));
    let snapshot = wait_for_message(&mut alice_channel, |m| {
        matches!(m, Message::PeerList { .. })
    })
    .await;
    assert_eq!(snapshot, Message::PeerList { peers: vec![] });

    let mut bob_channel = channel_for(addr, &bob);
    assert!(matches!(next_event(&mut bob_channel).await, Event::Connected));

    // Bob's snapshot contains Alice, including her advertised routes.
    let snapshot =
        wait_for_message(&mut bob_channel, |m| matches!(m, Message::PeerList { .. })).await;
    match snapshot {
        Message::PeerList { peers } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].id, alice.device_id);
            assert_eq!(peers[0].routes, vec!["192.168.10.0/24".to_owned()]);
        }
        other => panic!("expected peer-list, got {other:?}"),
    }

    // Alice hears about Bob joining.
    let joined =
        wait_for_message(&mut alice_channel, |m| matches!(m, Message::PeerJoined { .. })).await;
    match joined {
        Message::PeerJoined { peer } => assert_eq!(peer.id, bob.device_id),
        other => panic!("expected peer-joined, got {other:?}"),
    }

    // Offer goes Alice -> Bob, answer and a candidate come back.
    alice_channel.send(Message::Offer {
        to: bob.device_id.clone(),
        from: alice.device_id.clone(),
        sdp: "v=0 alice-offer".to_owned(),
    });

    let offer = wait_for_message(&mut bob_channel, |m| matches!(m, Message::Offer { .. })).await;
    assert_eq!(
        offer,
        Message::Offer {
            to: bob.device_id.clone(),
            from: alice.device_id.clone(),
            sdp: "v=0 alice-offer".to_owned(),
        }
    );

    bob_channel.send(Message::Answer {
        to: alice.device_id.clone(),
        from: bob.device_id.clone(),
        sdp: "v=0 bob-answer".to_owned(),
    });
    bob_channel.send(Message::Candidate {
        to: alice.device_id.clone(),
        from: bob.device_id.clone(),
        candidate: "candidate:1 1 UDP 1 192.0.2.7 4242 typ host".to_owned(),
    });

    wait_for_message(&mut alice_channel, |m| matches!(m, Message::Answer { .. })).await;
    wait_for_message(&mut alice_channel, |m| matches!(m, Message::Candidate { .. })).await;
}

#[tokio::test]
async fn routing_to_unknown_peer_returns_error() {
    let addr = spawn_worker().await;
    let alice = register(addr, "alice").await;

    let mut channel = channel_for(addr, &alice);
    assert!(matches!(next_event(&mut channel).await, Event::Connected));

    channel.send(Message::Offer {
        to: "nobody".to_owned(),
        from: alice.device_id.clone(),
        sdp: "v=0".to_owned(),
    });

    let error = wait_for_message(&mut channel, |m| matches!(m, Message::Error { .. })).await;
    match error {
        Message::Error { code, .. } => assert_eq!(code, "unknown-peer"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_broadcasts_peer_left() {
    let addr = spawn_worker().await;
    let alice = register(addr, "alice").await;
    let bob = register(addr, "bob").await;

    let mut alice_channel = channel_for(addr, &alice);
    assert!(matches!(next_event(&mut alice_channel).await, Event::Connected));

    let mut bob_channel = channel_for(addr, &bob);
    assert!(matches!(next_event(&mut bob_channel).await, Event::Connected));
    wait_for_message(&mut alice_channel, |m| matches!(m, Message::PeerJoined { .. })).await;

    drop(bob_channel);

    let left =
        wait_for_message(&mut alice_channel, |m| matches!(m, Message::PeerLeft { .. })).await;
    match left {
        Message::PeerLeft { peer } => assert_eq!(peer.id, bob.device_id),
        other => panic!("expected peer-left, got {other:?}"),
    }
}

#[tokio::test]
async fn revocation_fails_next_refresh_and_evicts_the_peer() {
    let addr = spawn_worker().await;
    let alice = register(addr, "alice").await;
    let bob = register(addr, "bob").await;

    let mut alice_channel = channel_for(addr, &alice);
    assert!(matches!(next_event(&mut alice_channel).await, Event::Connected));

    let mut bob_channel = channel_for(addr, &bob);
    assert!(matches!(next_event(&mut bob_channel).await, Event::Connected));
    wait_for_message(&mut alice_channel, |m| matches!(m, Message::PeerJoined { .. })).await;

    // The admin revokes Bob.
    let client = reqwest::Client::new();
    let status = client
        .delete(format!("http://{addr}/auth/devices/{}", bob.device_id))
        .bearer_auth(&alice.access_token)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);

    // Bob's next refresh carries the distinguished revocation signal.
    let response = client
        .post(format!("http://{addr}/auth/refresh"))
        .json(&serde_json::json!({
            "device_id": bob.device_id,
            "refresh_token": bob.refresh_token,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "device revoked");

    // Everyone else sees Bob leave promptly.
    let left =
        wait_for_message(&mut alice_channel, |m| matches!(m, Message::PeerLeft { .. })).await;
    match left {
        Message::PeerLeft { peer } => assert_eq!(peer.id, bob.device_id),
        other => panic!("expected peer-left, got {other:?}"),
    }
}

#[tokio::test]
async fn turn_endpoint_answers_stun_binding() {
    use bamgate_relay::Attribute;
    use bytecodec::{DecodeExt, EncodeExt};
    use stun_codec::rfc5389::attributes::XorMappedAddress;
    use stun_codec::rfc5389::methods::BINDING;
    use stun_codec::{Message as StunMessage, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
    use tokio_tungstenite::tungstenite;

    let addr = spawn_worker().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/turn"))
        .await
        .unwrap();

    let request = StunMessage::<Attribute>::new(
        MessageClass::Request,
        BINDING,
        TransactionId::new([7u8; 12]),
    );
    let bytes = MessageEncoder::default().encode_into_bytes(request).unwrap();

    ws.send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let tungstenite::Message::Binary(payload) = frame else {
        panic!("expected a binary frame");
    };

    let stripped = bamgate_relay::strip_fingerprint(&payload).unwrap();
    let response = MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&stripped)
        .unwrap()
        .unwrap();

    assert_eq!(response.class(), MessageClass::SuccessResponse);
    assert_eq!(response.method(), BINDING);
    assert!(response.get_attribute::<XorMappedAddress>().is_some());
}
