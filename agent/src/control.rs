//! The local control plane: HTTP over a Unix socket.
//!
//! The socket is world-connectable (0666) so unprivileged CLIs can query
//! status; mutating endpoints are still guarded by the agent's input
//! validation. Requests are relayed to the agent's event loop over a
//! channel so the peer table keeps a single writer.

use crate::config::PeerSelections;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rtc_mesh::{IceType, PeerState};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// One row of the peer table as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRow {
    pub id: String,
    pub address: String,
    pub state: PeerState,
    pub ice_type: IceType,
    pub data_channel_open: bool,
    pub accepted_routes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub device_name: String,
    pub device_id: String,
    pub tunnel_address: String,
    pub uptime_secs: u64,
    pub peers: Vec<PeerRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerOffering {
    pub id: String,
    pub advertised: PeerSelections,
    pub accepted: PeerSelections,
}

#[derive(Debug, Serialize)]
pub struct OfferingsResponse {
    pub peers: Vec<PeerOffering>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureBody {
    pub peer_id: String,
    pub selections: PeerSelections,
}

/// Requests the control server forwards into the agent.
pub enum ControlRequest {
    Status(oneshot::Sender<StatusResponse>),
    Offerings(oneshot::Sender<OfferingsResponse>),
    Configure {
        peer_id: String,
        selections: PeerSelections,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

#[derive(Clone)]
struct ControlState {
    requests: mpsc::Sender<ControlRequest>,
    access_token: watch::Receiver<SecretString>,
}

/// Picks the OS-appropriate socket directory, falling back to `/tmp`.
pub fn socket_path() -> PathBuf {
    let preferred = if cfg!(target_os = "macos") {
        Path::new("/var/run/bamgate")
    } else {
        Path::new("/run/bamgate")
    };

    for dir in [preferred, Path::new("/tmp/bamgate")] {
        if std::fs::create_dir_all(dir).is_ok() {
            return dir.join("control.sock");
        }
    }

    PathBuf::from("/tmp/bamgate-control.sock")
}

/// Binds the socket and serves until cancelled. Returns once the listener
/// is ready.
pub async fn serve(
    path: PathBuf,
    requests: mpsc::Sender<ControlRequest>,
    access_token: watch::Receiver<SecretString>,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    // A previous run may have left the socket file behind.
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("cannot remove stale socket {}", path.display()))
        }
    }

    let listener = tokio::net::UnixListener::bind(&path)
        .with_context(|| format!("cannot bind control socket {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))
            .with_context(|| format!("cannot set permissions on {}", path.display()))?;
    }

    let state = ControlState {
        requests,
        access_token,
    };

    let app = Router::new()
        .route("/status", get(status))
        .route("/peers/offerings", get(offerings))
        .route("/peers/configure", post(configure))
        .route("/token", get(token))
        .with_state(state);

    tracing::info!(path = %path.display(), "control socket listening");

    let handle = tokio::spawn(async move {
        let shutdown = {
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        };

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!("control server failed: {e}");
        }

        let _ = std::fs::remove_file(&path);
    });

    Ok(handle)
}

async fn status(State(state): State<ControlState>) -> Response {
    let (reply, rx) = oneshot::channel();

    if state
        .requests
        .send(ControlRequest::Status(reply))
        .await
        .is_err()
    {
        return agent_gone();
    }

    match rx.await {
        Ok(status) => Json(status).into_response(),
        Err(_) => agent_gone(),
    }
}

async fn offerings(State(state): State<ControlState>) -> Response {
    let (reply, rx) = oneshot::channel();

    if state
        .requests
        .send(ControlRequest::Offerings(reply))
        .await
        .is_err()
    {
        return agent_gone();
    }

    match rx.await {
        Ok(offerings) => Json(offerings).into_response(),
        Err(_) => agent_gone(),
    }
}

async fn configure(
    State(state): State<ControlState>,
    Json(body): Json<ConfigureBody>,
) -> Response {
    let (reply, rx) = oneshot::channel();

    let request = ControlRequest::Configure {
        peer_id: body.peer_id,
        selections: body.selections,
        reply,
    };

    if state.requests.send(request).await.is_err() {
        return agent_gone();
    }

    match rx.await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(message)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        Err(_) => agent_gone(),
    }
}

/// Lends the current access token to sibling CLIs so they never trigger a
/// refresh themselves (the refresh token is single-use).
async fn token(State(state): State<ControlState>) -> Response {
    let token = state.access_token.borrow().expose_secret().to_owned();

    Json(serde_json::json!({ "access_token": token })).into_response()
}

fn agent_gone() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "agent is shutting down" })),
    )
        .into_response()
}
