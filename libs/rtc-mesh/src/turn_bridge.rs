//! Presents the worker's TURN-over-WebSocket relay as a local UDP TURN
//! server.
//!
//! The ICE stack expects to reach a TURN server over UDP, but our relay is
//! only reachable through a WebSocket on the worker. The bridge closes that
//! gap: it binds `127.0.0.1:0` and maps datagrams 1:1 onto binary WebSocket
//! frames in both directions. Peers are configured with
//! `turn:127.0.0.1:<bridge-port>?transport=udp` plus REST credentials
//! derived from the shared TURN secret; everything the TURN protocol needs
//! (auth, allocations, channels) passes through unchanged.

use crate::Error;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

/// One datagram per frame; anything larger than this is not TURN traffic.
const MAX_FRAME: usize = 2048;

/// Handle to the bridge task.
pub struct TurnWsBridge {
    local_addr: SocketAddr,
}

impl TurnWsBridge {
    /// Binds the local socket and spawns the relay task.
    ///
    /// `token` follows the agent's access token; reconnects always present
    /// the latest value.
    pub async fn spawn(
        server_url: Url,
        token: watch::Receiver<SecretString>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(Error::Bridge)?;
        let local_addr = socket.local_addr().map_err(Error::Bridge)?;

        let turn_url = turn_url(&server_url).map_err(|e| {
            Error::Bridge(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        tokio::spawn(run(socket, turn_url, token, cancel));

        Ok(Self { local_addr })
    }

    /// The address to use in `turn:<addr>?transport=udp` ICE server URLs.
    pub fn turn_server_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn run(
    socket: UdpSocket,
    url: Url,
    token: watch::Receiver<SecretString>,
    cancel: CancellationToken,
) {
    let mut backoff = reconnect_backoff();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let bearer = token.borrow().expose_secret().to_owned();

        match connect(&url, &bearer).await {
            Ok(ws) => {
                backoff.reset();

                tracing::debug!(%url, "TURN bridge connected");

                if let ControlFlow::Shutdown = pump(&socket, ws, &cancel).await {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("TURN bridge connect failed: {e}");
            }
        }

        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!("TURN bridge stopped");
}

enum ControlFlow {
    Reconnect,
    Shutdown,
}

/// Shovels datagrams between the UDP socket and the WebSocket until either
/// side fails.
async fn pump(
    socket: &UdpSocket,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    cancel: &CancellationToken,
) -> ControlFlow {
    let (mut sink, mut stream) = ws.split();
    let mut buf = [0u8; MAX_FRAME];

    // The ICE agent talks from a single client socket; remember it so
    // replies go back to the right place.
    let mut client: Option<SocketAddr> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(tungstenite::Message::Close(None)).await;
                return ControlFlow::Shutdown;
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("bridge UDP receive failed: {e}");
                        return ControlFlow::Shutdown;
                    }
                };

                match client {
                    None => client = Some(from),
                    Some(known) if known != from => {
                        tracing::debug!(%known, %from, "second client socket on TURN bridge, following the newest");
                        client = Some(from);
                    }
                    Some(_) => {}
                }

                if sink
                    .send(tungstenite::Message::Binary(buf[..n].to_vec().into()))
                    .await
                    .is_err()
                {
                    return ControlFlow::Reconnect;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Binary(payload))) => {
                        let Some(to) = client else {
                            tracing::trace!("relay frame before any client datagram, dropping");
                            continue;
                        };

                        if let Err(e) = socket.send_to(&payload, to).await {
                            tracing::debug!("bridge UDP send failed: {e}");
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        return ControlFlow::Reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("TURN websocket failed: {e}");
                        return ControlFlow::Reconnect;
                    }
                }
            }
        }
    }
}

async fn connect(
    url: &Url,
    bearer: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tungstenite::Error,
> {
    use base64::Engine as _;
    use rand::RngCore as _;

    let mut key_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);

    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    };

    let request = tungstenite::handshake::client::Request::builder()
        .method("GET")
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            base64::engine::general_purpose::STANDARD.encode(key_bytes),
        )
        .header("Authorization", format!("Bearer {bearer}"))
        .uri(url.to_string())
        .body(())
        .expect("request from valid URL and string headers always builds");

    let (stream, _) = tokio_tungstenite::connect_async(request).await?;

    Ok(stream)
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        randomization_factor: 0.1,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

fn turn_url(server_url: &Url) -> anyhow::Result<Url> {
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

    url.set_path("/turn");

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_url_rewrites_scheme_and_path() {
        let url = turn_url(&Url::parse("https://worker.example.com").unwrap()).unwrap();

        assert_eq!(url.as_str(), "wss://worker.example.com/turn");
    }

    #[tokio::test]
    async fn bridge_binds_loopback() {
        let (_tx, rx) = watch::channel(SecretString::from("token"));

        let bridge = TurnWsBridge::spawn(
            Url::parse("ws://127.0.0.1:1").unwrap(),
            rx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(bridge.turn_server_addr().ip().is_loopback());
    }
}
