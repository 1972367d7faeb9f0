//! Token lifecycle: the REST refresh call and the background rotator.
//!
//! Refresh tokens are single-use; the server rotates them on every call.
//! The rotated token is persisted to the secrets file *before* the
//! in-memory copy is swapped, so a crash between refresh and persistence
//! never strands the agent with no valid token. If persistence fails the
//! in-memory token stays authoritative until the next restart.

use crate::config::{Secrets, ValidConfig};
use crate::error::AgentError;
use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Deadline for any auth HTTP call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Refresh when this much of the access token's lifetime has passed.
const ROTATE_AT: f64 = 0.8;

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct AuthClient {
    http: reqwest::Client,
    refresh_url: url::Url,
    device_id: String,
}

impl AuthClient {
    pub fn new(config: &ValidConfig) -> Result<Self> {
        let refresh_url = config
            .server_url
            .join("/auth/refresh")
            .context("cannot build refresh URL")?;

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .context("cannot build HTTP client")?,
            refresh_url,
            device_id: config.device_id.clone(),
        })
    }

    /// One refresh round trip.
    ///
    /// Distinguishes the fatal "device revoked" signal from transient
    /// transport failures.
    pub async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenResponse, AgentError> {
        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&serde_json::json!({
                "device_id": self.device_id,
                "refresh_token": refresh_token.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| AgentError::AuthTransient(anyhow!(e)))?;

        let status = response.status();

        if status.is_success() {
            return response
                .json::<TokenResponse>()
                .await
                .map_err(|e| AgentError::AuthTransient(anyhow!(e).context("malformed token response")));
        }

        let body = response.json::<ErrorBody>().await.ok();
        let message = body.map(|b| b.error).unwrap_or_else(|| status.to_string());

        if status == reqwest::StatusCode::FORBIDDEN || message.contains("revoked") {
            return Err(AgentError::AuthExpired);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            // An invalid refresh token will not become valid by retrying.
            return Err(AgentError::Fatal(anyhow!(
                "refresh token was rejected: {message}; re-register this device"
            )));
        }

        Err(AgentError::AuthTransient(anyhow!(
            "refresh returned {status}: {message}"
        )))
    }
}

/// Owns the tokens at runtime and drives rotation.
pub struct TokenManager {
    client: AuthClient,
    secrets_path: PathBuf,
    secrets: Secrets,

    access_token: watch::Sender<SecretString>,
    refresh_token: SecretString,
    expires_in: Duration,
}

impl TokenManager {
    /// Performs the startup refresh (15 s deadline) and returns the
    /// manager holding fresh tokens.
    pub async fn bootstrap(
        config: &ValidConfig,
        secrets_path: PathBuf,
        secrets: Secrets,
    ) -> Result<Self, AgentError> {
        let refresh_token = secrets
            .refresh_token
            .clone()
            .map(SecretString::from)
            .ok_or_else(|| {
                AgentError::ConfigInvalid(
                    "no refresh token in secrets file; register this device first".to_owned(),
                )
            })?;

        let client = AuthClient::new(config)?;

        let response = client.refresh(&refresh_token).await?;

        let (access_token, _) = watch::channel(SecretString::from(response.access_token.clone()));

        let mut manager = Self {
            client,
            secrets_path,
            secrets,
            access_token,
            refresh_token,
            expires_in: Duration::from_secs(response.expires_in),
        };

        manager.commit(response);

        Ok(manager)
    }

    /// A receiver that always holds the current access token. Reconnecting
    /// consumers (signaling, TURN bridge, control socket) borrow from here.
    pub fn access_token(&self) -> watch::Receiver<SecretString> {
        self.access_token.subscribe()
    }

    pub fn current_access_token(&self) -> SecretString {
        self.access_token.borrow().clone()
    }

    /// Runs the rotation loop until cancelled.
    ///
    /// Rotates at 80% of the token lifetime; transient failures retry with
    /// backoff while the cached token is still nominally valid. A revoked
    /// device surfaces as a fatal error to the caller.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        loop {
            let rotate_in = self.expires_in.mul_f64(ROTATE_AT);

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(rotate_in) => {}
            }

            let mut retry_delay = Duration::from_secs(1);
            let hard_deadline = tokio::time::Instant::now() + self.expires_in.mul_f64(1.0 - ROTATE_AT);

            loop {
                match self.client.refresh(&self.refresh_token).await {
                    Ok(response) => {
                        self.commit(response);
                        tracing::debug!("rotated access token");
                        break;
                    }
                    Err(AgentError::AuthTransient(e)) => {
                        if tokio::time::Instant::now() >= hard_deadline {
                            return Err(AgentError::AuthTransient(e.context(
                                "could not refresh before the cached access token expired",
                            )));
                        }

                        tracing::warn!("token refresh failed, retrying in {retry_delay:?}: {e:#}");

                        tokio::select! {
                            () = cancel.cancelled() => return Ok(()),
                            () = tokio::time::sleep(retry_delay) => {}
                        }

                        retry_delay = (retry_delay * 2).min(Duration::from_secs(60));
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
        }
    }

    /// Adopts a fresh token pair: persist first, then swap in memory.
    fn commit(&mut self, response: TokenResponse) {
        self.secrets.refresh_token = Some(response.refresh_token.clone());

        if let Err(e) = self.secrets.store(&self.secrets_path) {
            // In-memory state stays authoritative; the old on-disk token is
            // already invalid server-side, a restart will need re-registration
            // only if this keeps failing until shutdown.
            tracing::warn!("failed to persist rotated refresh token: {e:#}");
        }

        self.refresh_token = SecretString::from(response.refresh_token);
        self.expires_in = Duration::from_secs(response.expires_in);
        self.access_token
            .send_replace(SecretString::from(response.access_token));
    }
}
