//! Long-term-credential authentication for the relay.
//!
//! Credentials are derived REST-style from the shared `turn_secret` that the
//! worker hands every device at registration:
//!
//! - username: `{unix_expiry_timestamp}:{peer_id}`
//! - password: `base64(HMAC-SHA1(turn_secret, username))`
//!
//! A client can never mint credentials on its own because it lacks the
//! secret, and the relay can validate any username/password pair statelessly.
//! The long-term-credential key for MESSAGE-INTEGRITY is the usual
//! `MD5(username:realm:password)` as computed by the STUN codec.
//!
//! All messages other than Binding requests must be authenticated. Responses
//! are authenticated with the requesting client's credentials.

use crate::{Attribute, REALM};
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use bytecodec::EncodeExt as _;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use std::time::{Duration, SystemTime};
use stun_codec::rfc5389::attributes::{MessageIntegrity, Username};
use stun_codec::Message;

pub trait MessageIntegrityExt {
    fn verify(
        &self,
        turn_secret: &SecretString,
        username: &str,
        now: SystemTime,
    ) -> Result<(), Error>;
}

impl MessageIntegrityExt for MessageIntegrity {
    fn verify(
        &self,
        turn_secret: &SecretString,
        username: &str,
        now: SystemTime,
    ) -> Result<(), Error> {
        let (expiry_unix_timestamp, peer_id) = split_username(username)?;
        let expiry = systemtime_from_unix(expiry_unix_timestamp);

        if expiry < now {
            return Err(Error::Expired);
        }

        let password = generate_password(turn_secret, username);

        self.check_long_term_credential(
            &Username::new(format!("{expiry_unix_timestamp}:{peer_id}"))
                .map_err(|_| Error::InvalidUsername)?,
            &REALM,
            &password,
        )
        .map_err(|_| Error::InvalidPassword)?;

        Ok(())
    }
}

/// A [`Message`] that carries a MESSAGE-INTEGRITY attribute.
pub struct AuthenticatedMessage(Message<Attribute>);

impl AuthenticatedMessage {
    pub(crate) fn new(
        turn_secret: &SecretString,
        username: &Username,
        mut message: Message<Attribute>,
    ) -> Result<Self, Error> {
        // Fail early on malformed usernames so we never sign for them.
        split_username(username.name())?;

        let password = generate_password(turn_secret, username.name());

        let message_integrity =
            MessageIntegrity::new_long_term_credential(&message, username, &REALM, &password)?;

        message.add_attribute(message_integrity);

        Ok(Self(message))
    }

    /// Serializes the message; MESSAGE-INTEGRITY is already the last
    /// attribute, so a fingerprint may be appended to the result.
    pub(crate) fn encode(self) -> bytecodec::Result<Vec<u8>> {
        stun_codec::MessageEncoder::default().encode_into_bytes(self.0)
    }

    pub fn class(&self) -> stun_codec::MessageClass {
        self.0.class()
    }

    pub fn method(&self) -> stun_codec::Method {
        self.0.method()
    }

    pub fn get_attribute<T>(&self) -> Option<&T>
    where
        T: stun_codec::Attribute,
        Attribute: stun_codec::convert::TryAsRef<T>,
    {
        self.0.get_attribute()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credentials expired")]
    Expired,
    #[error("invalid password")]
    InvalidPassword,
    #[error("invalid username")]
    InvalidUsername,
    #[error("cannot authenticate message")]
    CannotAuthenticate(#[from] bytecodec::Error),
}

pub fn split_username(username: &str) -> Result<(u64, &str), Error> {
    let (expiry, peer_id) = username.split_once(':').ok_or(Error::InvalidUsername)?;

    if peer_id.is_empty() || peer_id.contains(':') {
        return Err(Error::InvalidUsername);
    }

    let expiry_unix_timestamp = expiry.parse::<u64>().map_err(|_| Error::InvalidUsername)?;

    Ok((expiry_unix_timestamp, peer_id))
}

/// Derives the TURN password for a username.
pub fn generate_password(turn_secret: &SecretString, username: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(turn_secret.expose_secret().as_bytes())
        .expect("HMAC accepts keys of any length");

    mac.update(username.as_bytes());

    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

/// Builds the credential pair a client should use, valid for `ttl`.
pub fn make_credentials(
    turn_secret: &SecretString,
    peer_id: &str,
    ttl: Duration,
    now: SystemTime,
) -> (String, String) {
    let expiry = (now + ttl)
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("expiry is later than the epoch")
        .as_secs();

    let username = format!("{expiry}:{peer_id}");
    let password = generate_password(turn_secret, &username);

    (username, password)
}

pub(crate) fn systemtime_from_unix(seconds: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stun_codec::rfc5389::methods::BINDING;
    use stun_codec::{MessageClass, TransactionId};

    const SECRET: &str = "fe91661c47c454d18259933d2214cd32947031cd963724de5c24bf959092e3e8";
    const OTHER_SECRET: &str = "490bd7971b2c86e262ac819eef0097df8d5042cb447a99167255a301ba5742c0";

    #[test]
    fn password_is_hmac_sha1_of_username() {
        // Independently computed with `echo -n "1700000000:dev-1" |
        // openssl dgst -sha1 -hmac "secret" -binary | base64`.
        let password = generate_password(&SecretString::from("secret"), "1700000000:dev-1");

        assert_eq!(password, "Y8StsKvRUYoT6u4lORRjVrTTFHg=");
    }

    #[test]
    fn valid_credentials_verify() {
        let secret = SecretString::from(SECRET);
        let message_integrity = message_integrity(&secret, 1685200000, "device-a");

        message_integrity
            .verify(
                &secret,
                "1685200000:device-a",
                systemtime_from_unix(1685200000 - 1000),
            )
            .expect("credentials to be valid");
    }

    #[test]
    fn expired_username_is_rejected() {
        let secret = SecretString::from(SECRET);
        let message_integrity = message_integrity(&secret, 1685199000, "device-a");

        let result = message_integrity.verify(
            &secret,
            "1685199000:device-a",
            systemtime_from_unix(1685200000),
        );

        assert!(matches!(result.unwrap_err(), Error::Expired));
    }

    #[test]
    fn different_turn_secret_makes_password_invalid() {
        let message_integrity =
            message_integrity(&SecretString::from(OTHER_SECRET), 1685200000, "device-a");

        let result = message_integrity.verify(
            &SecretString::from(SECRET),
            "1685200000:device-a",
            systemtime_from_unix(1685200000 - 1000),
        );

        assert!(matches!(result.unwrap_err(), Error::InvalidPassword));
    }

    #[test]
    fn username_needs_expiry_and_peer_id() {
        assert!(matches!(
            split_username("foobar").unwrap_err(),
            Error::InvalidUsername
        ));
        assert!(matches!(
            split_username("nonsense:device-a").unwrap_err(),
            Error::InvalidUsername
        ));
        assert!(matches!(
            split_username("1685200000:a:b").unwrap_err(),
            Error::InvalidUsername
        ));
        assert!(split_username("1685200000:device-a").is_ok());
    }

    #[test]
    fn make_credentials_round_trips_through_verify() {
        let secret = SecretString::from(SECRET);
        let now = systemtime_from_unix(1700000000);

        let (username, _) = make_credentials(&secret, "device-a", Duration::from_secs(600), now);

        let (expiry, peer_id) = split_username(&username).unwrap();
        assert_eq!(expiry, 1700000600);
        assert_eq!(peer_id, "device-a");

        let message_integrity = MessageIntegrity::new_long_term_credential(
            &sample_message(),
            &Username::new(username.clone()).unwrap(),
            &REALM,
            &generate_password(&secret, &username),
        )
        .unwrap();

        message_integrity
            .verify(&secret, &username, now)
            .expect("freshly minted credentials must verify");
    }

    fn message_integrity(
        turn_secret: &SecretString,
        expiry: u64,
        peer_id: &str,
    ) -> MessageIntegrity {
        let username = Username::new(format!("{expiry}:{peer_id}")).unwrap();
        let password = generate_password(turn_secret, username.name());

        MessageIntegrity::new_long_term_credential(&sample_message(), &username, &REALM, &password)
            .unwrap()
    }

    fn sample_message() -> Message<Attribute> {
        Message::new(
            MessageClass::Request,
            BINDING,
            TransactionId::new([0u8; 12]),
        )
    }
}
