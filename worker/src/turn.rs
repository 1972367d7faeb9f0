//! Glue between `/turn` WebSockets and the sans-IO relay server.
//!
//! Each WebSocket is one relay client. Frames go into the [`Server`]
//! under a lock; the commands it emits are fanned out to the per-client
//! outbound queues, and `Wake` deadlines become sleeping tasks that feed
//! the clock back in.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bamgate_relay::{ClientId, Command, Server};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// Outbound frames queued per client before we drop.
const CLIENT_QUEUE_DEPTH: usize = 256;

pub struct TurnGateway {
    server: Mutex<Server>,
    clients: DashMap<ClientId, mpsc::Sender<Vec<u8>>>,
    next_client_id: AtomicU64,
}

impl TurnGateway {
    pub fn new(turn_secret: SecretString) -> Self {
        Self {
            server: Mutex::new(Server::new(turn_secret)),
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_DEPTH);

        self.clients.insert(id, tx);
        self.with_server(|server| server.client_connected(id, remote));

        tracing::debug!(client = %id, %remote, "TURN client attached");

        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Binary(payload))) => {
                            self.with_server(|server| {
                                server.handle_client_input(&payload, id, Instant::now());
                            });
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {} // Text/ping/pong carry no TURN traffic.
                        Some(Err(e)) => {
                            tracing::debug!(client = %id, "TURN websocket error: {e}");
                            break;
                        }
                    }
                }
                outbound = rx.recv() => {
                    let Some(payload) = outbound else {
                        break;
                    };

                    if sink.send(WsMessage::Binary(payload.into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.clients.remove(&id);
        self.with_server(|server| server.client_disconnected(id));

        tracing::debug!(client = %id, "TURN client detached");
    }

    /// Runs a closure against the locked server, then executes every
    /// command it queued.
    fn with_server(self: &Arc<Self>, f: impl FnOnce(&mut Server)) {
        let mut wake_deadlines = Vec::new();

        {
            let mut server = self.server.lock().expect("relay lock never poisoned");

            f(&mut server);

            while let Some(command) = server.next_command() {
                match command {
                    Command::SendFrame { payload, recipient } => {
                        let Some(tx) = self.clients.get(&recipient) else {
                            tracing::debug!(client = %recipient, "dropping frame for detached client");
                            continue;
                        };

                        if tx.try_send(payload).is_err() {
                            tracing::debug!(client = %recipient, "client queue full, dropping frame");
                        }
                    }
                    Command::Wake { deadline } => wake_deadlines.push(deadline),
                }
            }
        }

        for deadline in wake_deadlines {
            let gateway = self.clone();

            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;

                gateway.with_server(|server| server.handle_deadline_reached(Instant::now()));
            });
        }
    }
}
