//! The agent's error taxonomy.
//!
//! Low-level failures are wrapped with context on the way up; the owning
//! supervisor classifies them into these kinds and decides between fatal
//! exit and retry.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Broken or incomplete configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The device was revoked server-side. Fatal; suggests re-registration.
    #[error("device authorization was revoked; re-register this device")]
    AuthExpired,

    /// Could not reach the auth endpoint. Retryable while the cached access
    /// token is still nominally valid.
    #[error("token refresh failed: {0}")]
    AuthTransient(#[source] anyhow::Error),

    /// Creating the TUN device failed for lack of privileges.
    #[error(
        "cannot create TUN device: permission denied (run as root or grant CAP_NET_ADMIN)"
    )]
    TunPermission,

    /// Any other fatal startup or runtime failure.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        1
    }
}
