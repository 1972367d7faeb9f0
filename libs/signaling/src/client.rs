//! The agent side of the signaling link.
//!
//! A single WebSocket to the worker's `/connect` endpoint, authenticated
//! with the device's JWT. The channel is a poll-based state machine: the
//! owner drives [`SignalingChannel::poll`] and reacts to the returned
//! [`Event`]s.
//!
//! Reconnects are automatic and unbounded with exponential backoff. On
//! every reconnect the channel re-sends the `join` and replays the last
//! un-acked SDP plus all in-flight candidates per peer whose negotiation has
//! not completed, so critical messages are delivered at least once. A
//! per-peer dedupe set (SDP hash + candidate string) keeps the replay from
//! flooding the hub with duplicates.

use crate::proto::Message;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use base64::Engine;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use std::{fmt, future, mem};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{self, http::StatusCode};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound messages buffered while disconnected. If we are connected these
/// never build up.
const MAX_BUFFERED_MESSAGES: usize = 64;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct SignalingChannel {
    state: State,
    waker: Option<Waker>,

    url: Url,
    token: SecretString,

    /// The join payload announced on every (re)connect.
    join: Message,

    pending_messages: VecDeque<Message>,

    replay: HashMap<String, PeerReplay>,

    make_reconnect_backoff: Box<dyn Fn() -> ExponentialBackoff + Send>,
    reconnect_backoff: Option<ExponentialBackoff>,

    ping_interval: tokio::time::Interval,
}

enum State {
    Closed,
    Connecting(BoxFuture<'static, Result<WsStream, InternalError>>),
    Connected(WsStream),
    Reconnect { backoff: Duration },
    Closing(WsStream),
}

/// Per-peer bookkeeping for at-least-once delivery across reconnects.
#[derive(Default)]
struct PeerReplay {
    /// The last offer or answer sent for the current negotiation.
    last_sdp: Option<Message>,
    /// Candidates trickled during the current negotiation.
    candidates: Vec<Message>,

    sdp_hashes: HashSet<[u8; 32]>,
    candidate_strings: HashSet<String>,
}

#[derive(Debug)]
pub enum Event {
    /// The WebSocket is up and the `join` has been queued.
    Connected,
    Inbound(Message),
    /// A transient transport failure; the channel reconnects by itself.
    Hiccup {
        backoff: Duration,
        error: anyhow::Error,
    },
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The worker rejected our token. The owner should refresh the token,
    /// call [`SignalingChannel::set_token`] and reconnect; a second
    /// rejection is fatal.
    #[error("signaling connection was rejected as unauthorized")]
    Unauthorized,
    #[error("fatal signaling error: {0}")]
    Fatal(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
enum InternalError {
    #[error("websocket error")]
    WebSocket(#[source] tungstenite::Error),
    #[error("failed to deserialize message")]
    Serde(#[source] serde_json::Error),
    #[error("hub closed the websocket connection")]
    StreamClosed,
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl SignalingChannel {
    /// Creates a channel in the disconnected state.
    ///
    /// Call [`SignalingChannel::connect`] to establish the link.
    pub fn disconnected(
        server_url: &Url,
        token: SecretString,
        join: Message,
        make_reconnect_backoff: impl Fn() -> ExponentialBackoff + Send + 'static,
    ) -> Result<Self, Error> {
        debug_assert!(matches!(join, Message::Join { .. }));

        let url = connect_url(server_url).map_err(Error::Fatal)?;

        Ok(Self {
            state: State::Closed,
            waker: None,
            url,
            token,
            join,
            pending_messages: VecDeque::with_capacity(MAX_BUFFERED_MESSAGES),
            replay: HashMap::new(),
            make_reconnect_backoff: Box::new(make_reconnect_backoff),
            reconnect_backoff: None,
            ping_interval: tokio::time::interval(WS_PING_INTERVAL),
        })
    }

    /// The default reconnect policy: 500 ms doubling up to 30 s, 10%
    /// jitter, unbounded retries.
    pub fn default_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Establishes a new connection, dropping the current one if any.
    pub fn connect(&mut self) {
        self.reconnect_backoff = None;
        self.state = State::Connecting(
            connect_websocket(self.url.clone(), self.token.clone()).boxed(),
        );

        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Swaps the bearer token used for future (re)connects.
    pub fn set_token(&mut self, token: SecretString) {
        self.token = token;
    }

    /// Queues a message, with per-peer replay bookkeeping.
    ///
    /// Duplicate offers (same SDP) and duplicate candidates are silently
    /// discarded.
    pub fn send(&mut self, message: Message) {
        match &message {
            Message::Offer { to, sdp, .. } | Message::Answer { to, sdp, .. } => {
                let hash = sha256(sdp.as_bytes());
                let entry = self.replay.entry(to.clone()).or_default();

                if !entry.sdp_hashes.insert(hash) {
                    tracing::debug!(peer = %to, "refusing to queue duplicate SDP");
                    return;
                }

                // A fresh SDP starts a fresh negotiation: previous
                // candidates belong to the old ufrag and must not replay.
                entry.candidates.clear();
                entry.last_sdp = Some(message.clone());
            }
            Message::Candidate { to, candidate, .. } => {
                let entry = self.replay.entry(to.clone()).or_default();

                if !entry.candidate_strings.insert(candidate.clone()) {
                    tracing::debug!(peer = %to, "refusing to queue duplicate candidate");
                    return;
                }

                entry.candidates.push(message.clone());
            }
            Message::Bye { to, .. } => {
                self.replay.remove(to);
            }
            _ => {}
        }

        self.queue(message);
    }

    /// Marks a peer's negotiation as settled; nothing is replayed for it on
    /// the next reconnect.
    pub fn negotiation_complete(&mut self, peer_id: &str) {
        if let Some(entry) = self.replay.get_mut(peer_id) {
            entry.last_sdp = None;
            entry.candidates.clear();
        }
    }

    /// Drops all replay state for a peer.
    pub fn peer_removed(&mut self, peer_id: &str) {
        self.replay.remove(peer_id);
    }

    /// Initiates a graceful close.
    pub fn close(&mut self) {
        self.pending_messages.clear();

        match mem::replace(&mut self.state, State::Closed) {
            State::Connected(stream) | State::Closing(stream) => {
                self.state = State::Closing(stream);
            }
            State::Closed | State::Connecting(_) | State::Reconnect { .. } => {}
        }

        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    pub fn poll(&mut self, cx: &mut Context) -> Poll<Result<Event, Error>> {
        loop {
            let stream = match &mut self.state {
                State::Closed => return Poll::Ready(Ok(Event::Closed)),
                State::Closing(stream) => match stream.poll_close_unpin(cx) {
                    Poll::Ready(Ok(())) => {
                        self.state = State::Closed;
                        return Poll::Ready(Ok(Event::Closed));
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::debug!("error while closing websocket: {e}");
                        self.state = State::Closed;
                        return Poll::Ready(Ok(Event::Closed));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Reconnect { backoff } => {
                    let backoff = *backoff;
                    let url = self.url.clone();
                    let token = self.token.clone();

                    self.state = State::Connecting(Box::pin(async move {
                        tokio::time::sleep(backoff).await;
                        connect_websocket(url, token).await
                    }));

                    continue;
                }
                State::Connecting(future) => match future.poll_unpin(cx) {
                    Poll::Ready(Ok(stream)) => {
                        self.reconnect_backoff = None;
                        self.ping_interval.reset();
                        self.state = State::Connected(stream);

                        self.prime_replay();

                        return Poll::Ready(Ok(Event::Connected));
                    }
                    Poll::Ready(Err(InternalError::WebSocket(tungstenite::Error::Http(r))))
                        if r.status() == StatusCode::UNAUTHORIZED
                            || r.status() == StatusCode::FORBIDDEN =>
                    {
                        self.state = State::Closed;
                        return Poll::Ready(Err(Error::Unauthorized));
                    }
                    Poll::Ready(Err(e)) => {
                        let backoff = self
                            .reconnect_backoff
                            .get_or_insert_with(|| (self.make_reconnect_backoff)())
                            .next_backoff()
                            .unwrap_or(Duration::from_secs(30));

                        self.state = State::Reconnect { backoff };

                        return Poll::Ready(Ok(Event::Hiccup {
                            backoff,
                            error: anyhow::Error::new(e)
                                .context("reconnecting to hub on transient error"),
                        }));
                    }
                    Poll::Pending => {
                        self.waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                },
                State::Connected(stream) => stream,
            };

            // Priority 1: ensure we are fully flushed.
            if let Err(e) = std::task::ready!(stream.poll_flush_unpin(cx)) {
                self.reconnect_on_transient_error(InternalError::WebSocket(e));
                continue;
            }

            // Priority 2: send pending messages.
            match stream.poll_ready_unpin(cx) {
                Poll::Ready(Ok(())) => {
                    if let Some(msg) = self.pending_messages.pop_front() {
                        let serialized = serde_json::to_string(&msg)
                            .map_err(|e| Error::Fatal(e.into()))?;

                        match stream
                            .start_send_unpin(tungstenite::Message::Text(serialized.clone().into()))
                        {
                            Ok(()) => {
                                tracing::trace!(target: "wire::signal::send", msg = %serialized);
                            }
                            Err(e) => {
                                self.pending_messages.push_front(msg);
                                self.reconnect_on_transient_error(InternalError::WebSocket(e));
                            }
                        }

                        continue;
                    }
                }
                Poll::Ready(Err(e)) => {
                    self.reconnect_on_transient_error(InternalError::WebSocket(e));
                    continue;
                }
                Poll::Pending => {}
            }

            // Priority 3: handle incoming messages.
            match stream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    let text = match frame {
                        tungstenite::Message::Text(text) => text,
                        tungstenite::Message::Close(_) => {
                            self.reconnect_on_transient_error(InternalError::StreamClosed);
                            continue;
                        }
                        // Ping/pong are handled by tungstenite itself.
                        _ => continue,
                    };

                    tracing::trace!(target: "wire::signal::recv", msg = %text);

                    match serde_json::from_str::<Message>(&text) {
                        Ok(message) => return Poll::Ready(Ok(Event::Inbound(message))),
                        Err(e) => {
                            tracing::warn!("failed to deserialize signaling message: {e}");
                            continue;
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.reconnect_on_transient_error(InternalError::WebSocket(e));
                    continue;
                }
                Poll::Ready(None) => {
                    self.reconnect_on_transient_error(InternalError::StreamClosed);
                    continue;
                }
                Poll::Pending => {}
            }

            // Priority 4: keepalive pings.
            if self.ping_interval.poll_tick(cx).is_ready() {
                if let Err(e) = stream.start_send_unpin(tungstenite::Message::Ping(Vec::new().into()))
                {
                    self.reconnect_on_transient_error(InternalError::WebSocket(e));
                }
                continue;
            }

            return Poll::Pending;
        }
    }

    fn queue(&mut self, message: Message) {
        if self.pending_messages.len() >= MAX_BUFFERED_MESSAGES {
            tracing::warn!(
                "outbound signaling buffer full ({MAX_BUFFERED_MESSAGES}); dropping oldest message"
            );
            self.pending_messages.pop_front();
        }

        self.pending_messages.push_back(message);

        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Re-queues the join plus all in-flight negotiation state.
    fn prime_replay(&mut self) {
        // The join must be the first message the hub sees.
        self.pending_messages.push_front(self.join.clone());

        let mut replayed = 0;
        for entry in self.replay.values() {
            if let Some(sdp) = &entry.last_sdp {
                self.pending_messages.push_back(sdp.clone());
                replayed += 1;
            }

            for candidate in &entry.candidates {
                self.pending_messages.push_back(candidate.clone());
                replayed += 1;
            }
        }

        if replayed > 0 {
            tracing::debug!(%replayed, "replaying in-flight negotiation messages after reconnect");
        }
    }

    /// Funnels a transport error through the `Connecting` state so the
    /// normal backoff logic applies.
    fn reconnect_on_transient_error(&mut self, e: InternalError) {
        self.state = State::Connecting(future::ready(Err(e)).boxed());
    }
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Closed => "closed",
            State::Connecting(_) => "connecting",
            State::Connected(_) => "connected",
            State::Reconnect { .. } => "reconnect",
            State::Closing(_) => "closing",
        };

        f.debug_struct("SignalingChannel")
            .field("state", &state)
            .field("pending", &self.pending_messages.len())
            .finish_non_exhaustive()
    }
}

fn connect_url(server_url: &Url) -> anyhow::Result<Url> {
    let mut url = server_url.clone();

    match url.scheme() {
        "http" => url
            .set_scheme("ws")
            .map_err(|_| anyhow::anyhow!("cannot rewrite scheme"))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| anyhow::anyhow!("cannot rewrite scheme"))?,
        "ws" | "wss" => {}
        other => anyhow::bail!("unsupported server URL scheme: {other}"),
    }

    url.set_path("/connect");

    Ok(url)
}

async fn connect_websocket(url: Url, token: SecretString) -> Result<WsStream, InternalError> {
    let duration = Duration::from_secs(10);

    let (stream, _) = tokio::time::timeout(
        duration,
        tokio_tungstenite::connect_async(make_request(&url, &token)),
    )
    .await
    .map_err(|_| InternalError::Timeout(duration))?
    .map_err(InternalError::WebSocket)?;

    Ok(stream)
}

// Same headers tungstenite would generate, plus the Authorization header.
fn make_request(url: &Url, token: &SecretString) -> Request {
    let mut r = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut r);
    let key = base64::engine::general_purpose::STANDARD.encode(r);

    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    };

    Request::builder()
        .method("GET")
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", key)
        .header(
            "Authorization",
            format!("Bearer {}", token.expose_secret()),
        )
        .uri(url.to_string())
        .body(())
        .expect("request from valid URL and string headers always builds")
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join() -> Message {
        Message::Join {
            peer_id: "a".to_owned(),
            public_key: "pk".to_owned(),
            address: "10.0.0.1/24".to_owned(),
            routes: vec![],
            dns: vec![],
            dns_search: vec![],
        }
    }

    fn channel() -> SignalingChannel {
        SignalingChannel::disconnected(
            &Url::parse("wss://hub.example.com").unwrap(),
            SecretString::from("jwt"),
            join(),
            SignalingChannel::default_backoff,
        )
        .unwrap()
    }

    fn offer(sdp: &str) -> Message {
        Message::Offer {
            to: "b".to_owned(),
            from: "a".to_owned(),
            sdp: sdp.to_owned(),
        }
    }

    fn candidate(c: &str) -> Message {
        Message::Candidate {
            to: "b".to_owned(),
            from: "a".to_owned(),
            candidate: c.to_owned(),
        }
    }

    #[tokio::test]
    async fn duplicate_offer_is_dropped() {
        let mut channel = channel();

        channel.send(offer("v=0 abc"));
        channel.send(offer("v=0 abc"));

        assert_eq!(channel.pending_messages.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_candidate_is_dropped() {
        let mut channel = channel();

        channel.send(candidate("candidate:1"));
        channel.send(candidate("candidate:1"));
        channel.send(candidate("candidate:2"));

        assert_eq!(channel.pending_messages.len(), 2);
    }

    #[tokio::test]
    async fn replay_contains_join_then_incomplete_negotiation() {
        let mut channel = channel();

        channel.send(offer("v=0 abc"));
        channel.send(candidate("candidate:1"));
        channel.pending_messages.clear(); // Pretend they went out.

        channel.prime_replay();

        let queued: Vec<_> = channel.pending_messages.iter().cloned().collect();
        assert_eq!(queued[0], join());
        assert!(queued.contains(&offer("v=0 abc")));
        assert!(queued.contains(&candidate("candidate:1")));
    }

    #[tokio::test]
    async fn completed_negotiation_is_not_replayed() {
        let mut channel = channel();

        channel.send(offer("v=0 abc"));
        channel.send(candidate("candidate:1"));
        channel.pending_messages.clear();

        channel.negotiation_complete("b");
        channel.prime_replay();

        assert_eq!(channel.pending_messages.len(), 1, "only the join remains");
    }

    #[tokio::test]
    async fn new_sdp_clears_stale_candidates_from_replay() {
        let mut channel = channel();

        channel.send(offer("v=0 first"));
        channel.send(candidate("candidate:old"));
        channel.send(offer("v=0 second"));
        channel.pending_messages.clear();

        channel.prime_replay();

        let queued: Vec<_> = channel.pending_messages.iter().cloned().collect();
        assert!(queued.contains(&offer("v=0 second")));
        assert!(
            !queued.contains(&candidate("candidate:old")),
            "candidates from the previous ufrag must not replay"
        );
    }

    #[tokio::test]
    async fn bye_clears_replay_state() {
        let mut channel = channel();

        channel.send(offer("v=0 abc"));
        channel.send(Message::Bye {
            to: "b".to_owned(),
            from: "a".to_owned(),
        });
        channel.pending_messages.clear();

        channel.prime_replay();

        assert_eq!(channel.pending_messages.len(), 1);
    }

    #[test]
    fn connect_url_rewrites_scheme_and_path() {
        let url = connect_url(&Url::parse("https://hub.example.com:8443/api").unwrap()).unwrap();

        assert_eq!(url.as_str(), "wss://hub.example.com:8443/connect");
    }
}
