//! Base64 handling of Curve25519 keys.

use anyhow::{Context, Result};
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use x25519_dalek::{PublicKey, StaticSecret};

pub fn parse_private_key(base64: &str) -> Result<StaticSecret> {
    Ok(StaticSecret::from(parse_key_bytes(base64)?))
}

pub fn parse_public_key(base64: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(parse_key_bytes(base64)?))
}

pub fn public_key_base64(key: &PublicKey) -> String {
    BASE64_STANDARD.encode(key.as_bytes())
}

fn parse_key_bytes(key: &str) -> Result<[u8; 32]> {
    let bytes = BASE64_STANDARD
        .decode(key.trim())
        .context("key is not valid base64")?;

    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must decode to exactly 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_keypair() {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);

        let encoded = public_key_base64(&public);
        let decoded = parse_public_key(&encoded).unwrap();

        assert_eq!(decoded.as_bytes(), public.as_bytes());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_public_key("YWJj").is_err());
    }
}
