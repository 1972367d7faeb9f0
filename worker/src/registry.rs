//! The device registry and token machinery.
//!
//! Devices register once with an identity-provider token and from then on
//! authenticate with short-lived HS256 JWTs, refreshed through single-use
//! rotating refresh tokens. Everything lives in memory behind one lock;
//! the worker is a single-network service, not a multi-tenant system.

use ip_network::Ipv4Network;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Access tokens are valid for one hour; agents rotate at 80% of that.
pub const ACCESS_TOKEN_TTL_SECS: u64 = 3600;

/// All devices share one signaling room.
pub const NETWORK_ROOM: &str = "default";

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub device_name: String,
    /// Tunnel address inside the network subnet.
    pub address: Ipv4Addr,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<u64>,
    pub revoked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Device id.
    pub sub: String,
    /// Device name, informational.
    pub name: String,
    /// The signaling room this device belongs to.
    pub room: String,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("identity token was rejected")]
    IdentityRejected,
    #[error("invalid refresh token")]
    InvalidRefreshToken,
    #[error("device revoked")]
    DeviceRevoked,
    #[error("unknown device")]
    UnknownDevice,
    #[error("invalid access token")]
    InvalidAccessToken,
    #[error("network is out of addresses")]
    SubnetExhausted,
}

/// Verifies the identity-provider token presented at registration.
///
/// Production uses the GitHub device-auth flow; tests plug in a static
/// allow-list.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<(), AuthError>;
}

/// Accepts any non-empty token. Stands in until the GitHub verifier is
/// configured; the worker refuses to start with it outside of dev mode.
pub struct AcceptNonEmpty;

impl TokenVerifier for AcceptNonEmpty {
    fn verify(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::IdentityRejected);
        }

        Ok(())
    }
}

struct DeviceRecord {
    device: Device,
    /// SHA-256 of the currently valid refresh token, if any.
    refresh_token_hash: Option<[u8; 32]>,
}

pub struct Registry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    subnet: Ipv4Network,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    turn_secret: SecretString,
    verifier: Box<dyn TokenVerifier>,
}

#[derive(Debug)]
pub struct IssuedCredentials {
    pub device_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub address: Ipv4Addr,
}

impl Registry {
    pub fn new(
        subnet: Ipv4Network,
        jwt_secret: &SecretString,
        turn_secret: SecretString,
        verifier: Box<dyn TokenVerifier>,
    ) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            subnet,
            encoding_key: EncodingKey::from_secret(jwt_secret.expose_secret().as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.expose_secret().as_bytes()),
            turn_secret,
            verifier,
        }
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn turn_secret(&self) -> &SecretString {
        &self.turn_secret
    }

    /// Registers a device, or re-registers an existing name.
    ///
    /// Re-registration keeps the device id and tunnel address and rotates
    /// both tokens; a revoked device must be deleted first.
    pub fn register(
        &self,
        identity_token: &str,
        device_name: &str,
    ) -> Result<IssuedCredentials, AuthError> {
        self.verifier.verify(identity_token)?;

        let mut devices = self.devices.lock().expect("registry lock never poisoned");

        let existing_id = devices
            .values()
            .find(|r| r.device.device_name == device_name)
            .map(|r| (r.device.device_id.clone(), r.device.revoked));

        let device_id = match existing_id {
            Some((_, true)) => return Err(AuthError::DeviceRevoked),
            Some((id, false)) => id,
            None => {
                let address = self
                    .next_free_address(&devices)
                    .ok_or(AuthError::SubnetExhausted)?;
                let device_id = uuid::Uuid::new_v4().to_string();

                devices.insert(
                    device_id.clone(),
                    DeviceRecord {
                        device: Device {
                            device_id: device_id.clone(),
                            device_name: device_name.to_owned(),
                            address,
                            created_at: unix_now(),
                            last_seen_at: None,
                            revoked: false,
                        },
                        refresh_token_hash: None,
                    },
                );

                device_id
            }
        };

        let record = devices
            .get_mut(&device_id)
            .expect("device inserted or found above");

        Ok(self.issue(record))
    }

    /// Rotates the refresh token.
    ///
    /// The presented token is invalidated atomically with issuing the next
    /// one, so at most one refresh token per device is ever valid.
    pub fn refresh(
        &self,
        device_id: &str,
        refresh_token: &str,
    ) -> Result<IssuedCredentials, AuthError> {
        let mut devices = self.devices.lock().expect("registry lock never poisoned");

        let record = devices
            .get_mut(device_id)
            .ok_or(AuthError::UnknownDevice)?;

        if record.device.revoked {
            return Err(AuthError::DeviceRevoked);
        }

        let presented = sha256(refresh_token.as_bytes());
        if record.refresh_token_hash != Some(presented) {
            return Err(AuthError::InvalidRefreshToken);
        }

        record.device.last_seen_at = Some(unix_now());

        Ok(self.issue(record))
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &self.decoding_key,
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidAccessToken)?;

        Ok(data.claims)
    }

    pub fn list_devices(&self) -> Vec<Device> {
        let devices = self.devices.lock().expect("registry lock never poisoned");

        let mut list: Vec<_> = devices.values().map(|r| r.device.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        list
    }

    /// Marks a device revoked and invalidates its refresh token. The next
    /// refresh fails with the distinguished revocation signal.
    pub fn revoke(&self, device_id: &str) -> Result<(), AuthError> {
        let mut devices = self.devices.lock().expect("registry lock never poisoned");

        let record = devices
            .get_mut(device_id)
            .ok_or(AuthError::UnknownDevice)?;

        record.device.revoked = true;
        record.refresh_token_hash = None;

        Ok(())
    }

    fn issue(&self, record: &mut DeviceRecord) -> IssuedCredentials {
        let refresh_token = random_token();
        record.refresh_token_hash = Some(sha256(refresh_token.as_bytes()));

        let claims = Claims {
            sub: record.device.device_id.clone(),
            name: record.device.device_name.clone(),
            room: NETWORK_ROOM.to_owned(),
            exp: unix_now() + ACCESS_TOKEN_TTL_SECS,
        };

        let access_token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .expect("HS256 encoding never fails");

        IssuedCredentials {
            device_id: record.device.device_id.clone(),
            access_token,
            refresh_token,
            expires_in: ACCESS_TOKEN_TTL_SECS,
            address: record.device.address,
        }
    }

    fn next_free_address(&self, devices: &HashMap<String, DeviceRecord>) -> Option<Ipv4Addr> {
        let used: std::collections::HashSet<Ipv4Addr> =
            devices.values().map(|r| r.device.address).collect();

        self.subnet
            .hosts()
            .find(|candidate| !used.contains(candidate))
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    hex::encode(bytes)
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set after 1970")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(
            "100.64.0.0/24".parse().unwrap(),
            &SecretString::from("jwt-secret"),
            SecretString::from("turn-secret"),
            Box::new(AcceptNonEmpty),
        )
    }

    #[test]
    fn register_assigns_distinct_addresses() {
        let registry = registry();

        let a = registry.register("gh", "alpha").unwrap();
        let b = registry.register("gh", "beta").unwrap();

        assert_ne!(a.address, b.address);
        assert!(registry.subnet().contains(a.address));
    }

    #[test]
    fn re_register_keeps_id_and_address() {
        let registry = registry();

        let first = registry.register("gh", "alpha").unwrap();
        let second = registry.register("gh", "alpha").unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.address, second.address);
        assert_ne!(first.refresh_token, second.refresh_token);
    }

    #[test]
    fn refresh_rotates_and_invalidates_previous_token() {
        let registry = registry();
        let creds = registry.register("gh", "alpha").unwrap();

        let rotated = registry
            .refresh(&creds.device_id, &creds.refresh_token)
            .unwrap();
        assert_ne!(rotated.refresh_token, creds.refresh_token);

        // The old token is single-use: a replay must fail.
        assert_eq!(
            registry
                .refresh(&creds.device_id, &creds.refresh_token)
                .unwrap_err(),
            AuthError::InvalidRefreshToken
        );

        // The rotated one works.
        registry
            .refresh(&creds.device_id, &rotated.refresh_token)
            .unwrap();
    }

    #[test]
    fn revoked_device_gets_distinguished_error() {
        let registry = registry();
        let creds = registry.register("gh", "alpha").unwrap();

        registry.revoke(&creds.device_id).unwrap();

        assert_eq!(
            registry
                .refresh(&creds.device_id, &creds.refresh_token)
                .unwrap_err(),
            AuthError::DeviceRevoked
        );
    }

    #[test]
    fn access_token_round_trips() {
        let registry = registry();
        let creds = registry.register("gh", "alpha").unwrap();

        let claims = registry.verify_access_token(&creds.access_token).unwrap();

        assert_eq!(claims.sub, creds.device_id);
        assert_eq!(claims.room, NETWORK_ROOM);
    }

    #[test]
    fn tampered_access_token_is_rejected() {
        let registry = registry();
        let creds = registry.register("gh", "alpha").unwrap();

        let mut tampered = creds.access_token.clone();
        tampered.push('x');

        assert!(registry.verify_access_token(&tampered).is_err());
    }

    #[test]
    fn empty_identity_token_is_rejected() {
        assert_eq!(
            registry().register("", "alpha").unwrap_err(),
            AuthError::IdentityRejected
        );
    }
}
