//! Typed views of the messages a relay client can send us.
//!
//! Decoding happens in two stages: the raw frame is discriminated by its
//! first two bits (STUN vs. ChannelData), then STUN messages are parsed into
//! per-method request structs so the server logic never deals with missing
//! attributes.

use crate::auth::{generate_password, split_username, systemtime_from_unix};
use crate::channel_data::ChannelData;
use crate::fingerprint::{strip_fingerprint, FingerprintError};
use crate::{Attribute, REALM};
use anyhow::{Context, Result};
use bytecodec::DecodeExt;
use secrecy::SecretString;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use stun_codec::rfc5389::attributes::{ErrorCode, MessageIntegrity, Nonce, Username};
use stun_codec::rfc5389::errors::BadRequest;
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5766::attributes::{
    ChannelNumber, Data, Lifetime, RequestedTransport, XorPeerAddress,
};
use stun_codec::rfc5766::methods::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, REFRESH, SEND};
use stun_codec::{Message, MessageClass, Method, TransactionId};
use uuid::Uuid;

/// See <https://www.rfc-editor.org/rfc/rfc8656#name-requested-transport>.
pub(crate) const UDP_TRANSPORT: u8 = 17;

/// The maximum lifetime of an allocation.
const MAX_ALLOCATION_LIFETIME: Duration = Duration::from_secs(3600);

/// The default lifetime of an allocation.
const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);

#[derive(Default, Debug)]
pub struct Decoder {
    stun_message_decoder: stun_codec::MessageDecoder<Attribute>,
}

impl Decoder {
    /// Decodes a frame received from a client.
    ///
    /// The outer `Result` is a parse failure (drop the frame), the inner
    /// `Err` is a semantically invalid STUN message together with the error
    /// response to send back.
    pub fn decode<'a>(
        &mut self,
        input: &'a [u8],
    ) -> Result<Result<ClientMessage<'a>, Message<Attribute>>, Error> {
        // De-multiplex as per <https://www.rfc-editor.org/rfc/rfc8656#name-channels-2>.
        match input.first() {
            Some(0..=3) => {
                let without_fingerprint = strip_fingerprint(input)?;

                let message = match self
                    .stun_message_decoder
                    .decode_from_bytes(&without_fingerprint)?
                {
                    Ok(message) => message,
                    Err(broken_message) => {
                        let method = broken_message.method();
                        let transaction_id = broken_message.transaction_id();
                        let error = broken_message.error().clone();

                        tracing::debug!(?transaction_id, method = %method.as_u16(), %error, "Failed to decode attributes of message");

                        return Ok(Err(error_response(
                            method,
                            transaction_id,
                            ErrorCode::from(error),
                        )));
                    }
                };

                use MessageClass::*;
                match (message.method(), message.class()) {
                    (BINDING, Request) => Ok(Ok(ClientMessage::Binding(Binding::parse(&message)))),
                    (ALLOCATE, Request) => {
                        Ok(Allocate::parse(&message).map(ClientMessage::Allocate))
                    }
                    (REFRESH, Request) => Ok(Ok(ClientMessage::Refresh(Refresh::parse(&message)))),
                    (CHANNEL_BIND, Request) => {
                        Ok(ChannelBind::parse(&message).map(ClientMessage::ChannelBind))
                    }
                    (CREATE_PERMISSION, Request) => Ok(CreatePermission::parse(&message)
                        .map(ClientMessage::CreatePermission)),
                    (SEND, Indication) => Ok(Send::parse(&message).map(ClientMessage::Send)),
                    (_, Request) => Ok(Err(bad_request(&message))),
                    (method, class) => Err(Error::DecodeStun(bytecodec::Error::from(
                        io::Error::new(
                            io::ErrorKind::Unsupported,
                            format!(
                                "handling method {} and {class:?} is not implemented",
                                method.as_u16()
                            ),
                        ),
                    ))),
                }
            }
            Some(64..=127) => Ok(Ok(ClientMessage::ChannelData(ChannelData::parse(input)?))),
            Some(other) => Err(Error::UnknownMessageType(*other)),
            None => Err(Error::Eof),
        }
    }
}

#[derive(Debug)]
pub enum ClientMessage<'a> {
    ChannelData(ChannelData<'a>),
    Binding(Binding),
    Allocate(Allocate),
    Refresh(Refresh),
    ChannelBind(ChannelBind),
    CreatePermission(CreatePermission),
    Send(Send),
}

impl ClientMessage<'_> {
    pub fn username(&self) -> Option<&Username> {
        match self {
            ClientMessage::ChannelData(_)
            | ClientMessage::Binding(_)
            | ClientMessage::Send(_) => None,
            ClientMessage::Allocate(request) => request.username(),
            ClientMessage::Refresh(request) => request.username(),
            ClientMessage::ChannelBind(request) => request.username(),
            ClientMessage::CreatePermission(request) => request.username(),
        }
    }
}

/// Accessors shared by all STUN requests the relay answers.
pub(crate) trait StunRequest {
    fn transaction_id(&self) -> TransactionId;
    fn method(&self) -> Method;
}

macro_rules! impl_stun_request {
    ($t:ty, $method:expr) => {
        impl StunRequest for $t {
            fn transaction_id(&self) -> TransactionId {
                self.transaction_id
            }

            fn method(&self) -> Method {
                $method
            }
        }
    };
}

impl_stun_request!(Allocate, ALLOCATE);
impl_stun_request!(Refresh, REFRESH);
impl_stun_request!(ChannelBind, CHANNEL_BIND);
impl_stun_request!(CreatePermission, CREATE_PERMISSION);

/// Accessors shared by requests that require authentication.
pub(crate) trait ProtectedRequest {
    fn message_integrity(&self) -> Option<&MessageIntegrity>;
    fn username(&self) -> Option<&Username>;
    fn nonce(&self) -> Option<&Nonce>;
}

macro_rules! impl_protected_request {
    ($t:ty) => {
        impl ProtectedRequest for $t {
            fn message_integrity(&self) -> Option<&MessageIntegrity> {
                self.message_integrity.as_ref()
            }

            fn username(&self) -> Option<&Username> {
                self.username.as_ref()
            }

            fn nonce(&self) -> Option<&Nonce> {
                self.nonce.as_ref()
            }
        }
    };
}

impl_protected_request!(Allocate);
impl_protected_request!(Refresh);
impl_protected_request!(ChannelBind);
impl_protected_request!(CreatePermission);

#[derive(Debug)]
pub struct Binding {
    transaction_id: TransactionId,
}

impl Binding {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self { transaction_id }
    }

    pub fn parse(message: &Message<Attribute>) -> Self {
        Binding {
            transaction_id: message.transaction_id(),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }
}

#[derive(Debug)]
pub struct Allocate {
    transaction_id: TransactionId,
    message_integrity: Option<MessageIntegrity>,
    requested_transport: RequestedTransport,
    lifetime: Option<Lifetime>,
    username: Option<Username>,
    nonce: Option<Nonce>,
}

impl Allocate {
    pub fn new_unauthenticated_udp(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            message_integrity: None,
            requested_transport: RequestedTransport::new(UDP_TRANSPORT),
            lifetime: None,
            username: None,
            nonce: None,
        }
    }

    pub fn new_authenticated_udp(
        transaction_id: TransactionId,
        lifetime: Option<Lifetime>,
        username: Username,
        turn_secret: &SecretString,
        nonce: Uuid,
    ) -> Result<Self> {
        let nonce = Nonce::new(nonce.as_hyphenated().to_string()).context("Invalid nonce")?;
        let requested_transport = RequestedTransport::new(UDP_TRANSPORT);

        let mut message =
            Message::<Attribute>::new(MessageClass::Request, ALLOCATE, transaction_id);
        message.add_attribute(requested_transport.clone());
        message.add_attribute(username.clone());
        message.add_attribute((*REALM).clone());
        message.add_attribute(nonce.clone());

        if let Some(lifetime) = &lifetime {
            message.add_attribute(lifetime.clone());
        }

        let message_integrity = make_message_integrity(&message, &username, turn_secret)?;

        Ok(Self {
            transaction_id,
            message_integrity: Some(message_integrity),
            requested_transport,
            lifetime,
            username: Some(username),
            nonce: Some(nonce),
        })
    }

    pub fn parse(message: &Message<Attribute>) -> Result<Self, Message<Attribute>> {
        let requested_transport = message
            .get_attribute::<RequestedTransport>()
            .ok_or(bad_request(message))?
            .clone();

        Ok(Allocate {
            transaction_id: message.transaction_id(),
            message_integrity: message.get_attribute::<MessageIntegrity>().cloned(),
            requested_transport,
            lifetime: message.get_attribute::<Lifetime>().cloned(),
            username: message.get_attribute::<Username>().cloned(),
            nonce: message.get_attribute::<Nonce>().cloned(),
        })
    }

    pub fn requested_transport(&self) -> &RequestedTransport {
        &self.requested_transport
    }

    pub fn effective_lifetime(&self) -> Lifetime {
        compute_effective_lifetime(self.lifetime.as_ref())
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }
}

#[derive(Debug)]
pub struct Refresh {
    transaction_id: TransactionId,
    message_integrity: Option<MessageIntegrity>,
    lifetime: Option<Lifetime>,
    username: Option<Username>,
    nonce: Option<Nonce>,
}

impl Refresh {
    pub fn new(
        transaction_id: TransactionId,
        lifetime: Option<Lifetime>,
        username: Username,
        turn_secret: &SecretString,
        nonce: Uuid,
    ) -> Result<Self> {
        let nonce = Nonce::new(nonce.as_hyphenated().to_string()).context("Invalid nonce")?;

        let mut message = Message::<Attribute>::new(MessageClass::Request, REFRESH, transaction_id);
        message.add_attribute(username.clone());
        message.add_attribute((*REALM).clone());
        message.add_attribute(nonce.clone());

        if let Some(lifetime) = &lifetime {
            message.add_attribute(lifetime.clone());
        }

        let message_integrity = make_message_integrity(&message, &username, turn_secret)?;

        Ok(Self {
            transaction_id,
            message_integrity: Some(message_integrity),
            lifetime,
            username: Some(username),
            nonce: Some(nonce),
        })
    }

    pub fn parse(message: &Message<Attribute>) -> Self {
        Refresh {
            transaction_id: message.transaction_id(),
            message_integrity: message.get_attribute::<MessageIntegrity>().cloned(),
            lifetime: message.get_attribute::<Lifetime>().cloned(),
            username: message.get_attribute::<Username>().cloned(),
            nonce: message.get_attribute::<Nonce>().cloned(),
        }
    }

    pub fn effective_lifetime(&self) -> Lifetime {
        compute_effective_lifetime(self.lifetime.as_ref())
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }
}

#[derive(Debug)]
pub struct ChannelBind {
    transaction_id: TransactionId,
    channel_number: ChannelNumber,
    message_integrity: Option<MessageIntegrity>,
    nonce: Option<Nonce>,
    xor_peer_address: XorPeerAddress,
    username: Option<Username>,
}

impl ChannelBind {
    pub fn new(
        transaction_id: TransactionId,
        channel_number: ChannelNumber,
        xor_peer_address: XorPeerAddress,
        username: Username,
        turn_secret: &SecretString,
        nonce: Uuid,
    ) -> Result<Self> {
        let nonce = Nonce::new(nonce.as_hyphenated().to_string()).context("Invalid nonce")?;

        let mut message =
            Message::<Attribute>::new(MessageClass::Request, CHANNEL_BIND, transaction_id);
        message.add_attribute(username.clone());
        message.add_attribute((*REALM).clone());
        message.add_attribute(nonce.clone());
        message.add_attribute(channel_number);
        message.add_attribute(xor_peer_address.clone());

        let message_integrity = make_message_integrity(&message, &username, turn_secret)?;

        Ok(Self {
            transaction_id,
            channel_number,
            message_integrity: Some(message_integrity),
            nonce: Some(nonce),
            xor_peer_address,
            username: Some(username),
        })
    }

    pub fn parse(message: &Message<Attribute>) -> Result<Self, Message<Attribute>> {
        let channel_number = message
            .get_attribute::<ChannelNumber>()
            .copied()
            .ok_or(bad_request(message))?;
        let xor_peer_address = message
            .get_attribute::<XorPeerAddress>()
            .ok_or(bad_request(message))?
            .clone();

        Ok(ChannelBind {
            transaction_id: message.transaction_id(),
            channel_number,
            message_integrity: message.get_attribute::<MessageIntegrity>().cloned(),
            nonce: message.get_attribute::<Nonce>().cloned(),
            xor_peer_address,
            username: message.get_attribute::<Username>().cloned(),
        })
    }

    pub fn channel_number(&self) -> ChannelNumber {
        self.channel_number
    }

    pub fn xor_peer_address(&self) -> &XorPeerAddress {
        &self.xor_peer_address
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }
}

#[derive(Debug)]
pub struct CreatePermission {
    transaction_id: TransactionId,
    message_integrity: Option<MessageIntegrity>,
    username: Option<Username>,
    nonce: Option<Nonce>,
    xor_peer_addresses: Vec<XorPeerAddress>,
}

impl CreatePermission {
    pub fn new(
        transaction_id: TransactionId,
        xor_peer_address: XorPeerAddress,
        username: Username,
        turn_secret: &SecretString,
        nonce: Uuid,
    ) -> Result<Self> {
        let nonce = Nonce::new(nonce.as_hyphenated().to_string()).context("Invalid nonce")?;

        let mut message =
            Message::<Attribute>::new(MessageClass::Request, CREATE_PERMISSION, transaction_id);
        message.add_attribute(username.clone());
        message.add_attribute((*REALM).clone());
        message.add_attribute(nonce.clone());
        message.add_attribute(xor_peer_address.clone());

        let message_integrity = make_message_integrity(&message, &username, turn_secret)?;

        Ok(Self {
            transaction_id,
            message_integrity: Some(message_integrity),
            username: Some(username),
            nonce: Some(nonce),
            xor_peer_addresses: vec![xor_peer_address],
        })
    }

    pub fn parse(message: &Message<Attribute>) -> Result<Self, Message<Attribute>> {
        // A CreatePermission request must carry at least one peer address.
        // `stun_codec` surfaces repeated attributes through `get_attributes`.
        let xor_peer_addresses = message
            .attributes()
            .filter_map(|a| match a {
                Attribute::XorPeerAddress(peer) => Some(peer.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();

        if xor_peer_addresses.is_empty() {
            return Err(bad_request(message));
        }

        Ok(CreatePermission {
            transaction_id: message.transaction_id(),
            message_integrity: message.get_attribute::<MessageIntegrity>().cloned(),
            username: message.get_attribute::<Username>().cloned(),
            nonce: message.get_attribute::<Nonce>().cloned(),
            xor_peer_addresses,
        })
    }

    pub fn xor_peer_addresses(&self) -> &[XorPeerAddress] {
        &self.xor_peer_addresses
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }
}

/// A Send indication: datagram from the client towards a peer's relay
/// address. Indications are not authenticated and never answered.
#[derive(Debug)]
pub struct Send {
    xor_peer_address: XorPeerAddress,
    data: Data,
}

impl Send {
    pub fn new(peer: SocketAddr, data: Vec<u8>) -> Result<Self> {
        Ok(Self {
            xor_peer_address: XorPeerAddress::new(peer),
            data: Data::new(data).context("payload too large for a DATA attribute")?,
        })
    }

    pub fn parse(message: &Message<Attribute>) -> Result<Self, Message<Attribute>> {
        let xor_peer_address = message
            .get_attribute::<XorPeerAddress>()
            .ok_or(bad_request(message))?
            .clone();
        let data = message
            .get_attribute::<Data>()
            .ok_or(bad_request(message))?
            .clone();

        Ok(Send {
            xor_peer_address,
            data,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.xor_peer_address.address()
    }

    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    pub fn into_message(self, transaction_id: TransactionId) -> Message<Attribute> {
        let mut message = Message::new(MessageClass::Indication, SEND, transaction_id);
        message.add_attribute(self.xor_peer_address);
        message.add_attribute(self.data);

        message
    }
}

fn make_message_integrity(
    message: &Message<Attribute>,
    username: &Username,
    turn_secret: &SecretString,
) -> Result<MessageIntegrity> {
    let (_, _) = split_username(username.name()).context("Invalid username")?;

    let password = generate_password(turn_secret, username.name());

    Ok(MessageIntegrity::new_long_term_credential(
        message, username, &REALM, &password,
    )?)
}

/// Computes the effective lifetime of an allocation.
pub(crate) fn compute_effective_lifetime(requested_lifetime: Option<&Lifetime>) -> Lifetime {
    let Some(requested) = requested_lifetime else {
        return Lifetime::new(DEFAULT_ALLOCATION_LIFETIME)
            .expect("default lifetime is less than 0xFFFF_FFFF");
    };

    let effective_lifetime = requested.lifetime().min(MAX_ALLOCATION_LIFETIME);

    Lifetime::new(effective_lifetime)
        .expect("lifetime is at most MAX_ALLOCATION_LIFETIME which is less than 0xFFFF_FFFF")
}

fn bad_request(message: &Message<Attribute>) -> Message<Attribute> {
    error_response(
        message.method(),
        message.transaction_id(),
        ErrorCode::from(BadRequest),
    )
}

fn error_response(
    method: Method,
    transaction_id: TransactionId,
    error_code: ErrorCode,
) -> Message<Attribute> {
    let mut message = Message::new(MessageClass::ErrorResponse, method, transaction_id);
    message.add_attribute(error_code);

    message
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad channel data message: {0}")]
    BadChannelData(#[from] io::Error),
    #[error("failed to decode STUN message: {0}")]
    DecodeStun(#[from] bytecodec::Error),
    #[error("broken fingerprint: {0}")]
    BadFingerprint(#[from] FingerprintError),
    #[error("unknown message type: {0:#x}")]
    UnknownMessageType(u8),
    #[error("unexpected EOF while parsing message")]
    Eof,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_lifetime_is_capped_at_max_lifetime() {
        let requested_lifetime = Lifetime::new(Duration::from_secs(10_000_000)).unwrap();

        let effective_lifetime = compute_effective_lifetime(Some(&requested_lifetime));

        assert_eq!(effective_lifetime.lifetime(), MAX_ALLOCATION_LIFETIME)
    }

    #[test]
    fn no_requested_lifetime_yields_default() {
        assert_eq!(
            compute_effective_lifetime(None).lifetime(),
            DEFAULT_ALLOCATION_LIFETIME
        )
    }
}
