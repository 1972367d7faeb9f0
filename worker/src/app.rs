//! HTTP surface of the worker: device-registry REST, the signaling
//! WebSocket and the TURN WebSocket.

use crate::hub::{self, Rooms};
use crate::registry::{self, AuthError, Claims, Registry};
use crate::turn::TurnGateway;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use signaling::{Message, PeerInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub rooms: Arc<Rooms>,
    pub turn: Arc<TurnGateway>,
    pub server_url: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/refresh", post(refresh))
        .route("/auth/devices", get(list_devices))
        .route("/auth/devices/{id}", delete(revoke_device))
        .route("/connect", get(connect_ws))
        .route("/turn", get(turn_ws))
        .with_state(state)
}

// === REST =================================================================

#[derive(Deserialize)]
struct RegisterBody {
    github_token: String,
    device_name: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    device_id: String,
    access_token: String,
    refresh_token: String,
    address: String,
    subnet: String,
    turn_secret: String,
    server_url: String,
}

async fn register(State(state): State<AppState>, Json(body): Json<RegisterBody>) -> Response {
    match state.registry.register(&body.github_token, &body.device_name) {
        Ok(creds) => {
            tracing::info!(device = %body.device_name, id = %creds.device_id, "registered device");

            Json(RegisterResponse {
                device_id: creds.device_id,
                access_token: creds.access_token,
                refresh_token: creds.refresh_token,
                address: creds.address.to_string(),
                subnet: state.registry.subnet().to_string(),
                turn_secret: state.registry.turn_secret().expose_secret().to_owned(),
                server_url: state.server_url.clone(),
            })
            .into_response()
        }
        Err(e) => auth_error_response(e),
    }
}

#[derive(Deserialize)]
struct RefreshBody {
    device_id: String,
    refresh_token: String,
}

#[derive(Serialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshBody>) -> Response {
    match state.registry.refresh(&body.device_id, &body.refresh_token) {
        Ok(creds) => Json(RefreshResponse {
            access_token: creds.access_token,
            refresh_token: creds.refresh_token,
            expires_in: creds.expires_in,
        })
        .into_response(),
        Err(e) => auth_error_response(e),
    }
}

#[derive(Serialize)]
struct DevicesResponse {
    devices: Vec<registry::Device>,
}

async fn list_devices(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = bearer_claims(&state, &headers) {
        return auth_error_response(e);
    }

    Json(DevicesResponse {
        devices: state.registry.list_devices(),
    })
    .into_response()
}

async fn revoke_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = bearer_claims(&state, &headers) {
        return auth_error_response(e);
    }

    match state.registry.revoke(&id) {
        Ok(()) => {
            // Cut the signaling socket so the room notices right away.
            state.rooms.kick(registry::NETWORK_ROOM, &id);

            tracing::info!(device = %id, "revoked device");

            StatusCode::OK.into_response()
        }
        Err(e) => auth_error_response(e),
    }
}

fn bearer_claims(state: &AppState, headers: &HeaderMap) -> Result<Claims, AuthError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::InvalidAccessToken)?;

    state.registry.verify_access_token(token)
}

fn auth_error_response(error: AuthError) -> Response {
    let status = match error {
        AuthError::IdentityRejected
        | AuthError::InvalidRefreshToken
        | AuthError::InvalidAccessToken => StatusCode::UNAUTHORIZED,
        AuthError::DeviceRevoked => StatusCode::FORBIDDEN,
        AuthError::UnknownDevice => StatusCode::NOT_FOUND,
        AuthError::SubnetExhausted => StatusCode::CONFLICT,
    };

    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}

// === signaling ============================================================

async fn connect_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match bearer_claims(&state, &headers) {
        Ok(claims) => claims,
        Err(e) => return auth_error_response(e),
    };

    ws.on_upgrade(move |socket| handle_signaling(state, claims, socket))
}

async fn handle_signaling(state: AppState, claims: Claims, mut socket: WebSocket) {
    // The very first message must be a join.
    let join = tokio::time::timeout(Duration::from_secs(10), recv_message(&mut socket)).await;

    let info = match join {
        Ok(Some(Message::Join {
            public_key,
            address,
            routes,
            dns,
            dns_search,
            ..
        })) => PeerInfo {
            // The authenticated identity wins over whatever the client put
            // in the join.
            id: claims.sub.clone(),
            public_key,
            address,
            routes,
            dns,
            dns_search,
        },
        Ok(Some(_)) | Ok(None) | Err(_) => {
            let error = hub::error_message("join-required", "first message must be a join");
            let _ = send_message(&mut socket, &error).await;
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel(hub::MEMBER_QUEUE_DEPTH);
    let joined = state.rooms.join(&claims.room, info, tx);

    if send_message(&mut socket, &joined.peer_list).await.is_err() {
        state
            .rooms
            .leave(&claims.room, &claims.sub, joined.generation);
        return;
    }

    tracing::info!(room = %claims.room, peer = %claims.sub, "peer joined");

    loop {
        tokio::select! {
            inbound = recv_message(&mut socket) => {
                let Some(message) = inbound else {
                    break;
                };

                match &message {
                    Message::Offer { .. }
                    | Message::Answer { .. }
                    | Message::Candidate { .. }
                    | Message::Bye { .. } => {
                        if let Err(error) = state.rooms.route(&claims.room, &claims.sub, message) {
                            let _ = send_message(&mut socket, &error).await;
                        }
                    }
                    Message::Join { .. } => {
                        // Repeat joins after reconnect races are harmless.
                        tracing::debug!(peer = %claims.sub, "ignoring repeated join");
                    }
                    other => {
                        tracing::debug!(peer = %claims.sub, ?other, "ignoring client message");
                    }
                }
            }
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    // Kicked: a newer attachment took over or the device
                    // was revoked.
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                };

                if send_message(&mut socket, &message).await.is_err() {
                    break;
                }
            }
        }
    }

    state
        .rooms
        .leave(&claims.room, &claims.sub, joined.generation);
    tracing::info!(room = %claims.room, peer = %claims.sub, "peer left");
}

async fn recv_message(socket: &mut WebSocket) -> Option<Message> {
    loop {
        match socket.recv().await? {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Message>(&text) {
                Ok(message) => return Some(message),
                Err(e) => {
                    tracing::debug!("undecodable signaling message: {e}");
                    continue;
                }
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("signaling socket error: {e}");
                return None;
            }
        }
    }
}

async fn send_message(socket: &mut WebSocket, message: &Message) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).expect("protocol messages always serialize");

    socket.send(WsMessage::Text(text.into())).await
}

// === TURN =================================================================

async fn turn_ws(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    // TURN performs its own long-term-credential authentication inside the
    // socket; the HTTP layer just upgrades.
    ws.on_upgrade(move |socket| state.turn.clone().handle_socket(socket, remote))
}
