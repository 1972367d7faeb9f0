//! A sans-IO STUN/TURN-lite server for relaying traffic between mesh peers
//! that cannot form a direct path.
//!
//! Unlike a classic TURN deployment, clients reach this server over a
//! WebSocket that carries one STUN message or one ChannelData frame per
//! binary frame. Relay addresses handed out by [`Server`] are therefore
//! *virtual*: they live in `10.255.0.0/16`, exist only inside the server's
//! allocation table and are never bound on any kernel interface. All
//! relayed traffic is delivered back over the same WebSockets.
//!
//! The [`Server`] is sans-IO: callers feed it bytes via
//! [`Server::handle_client_input`] and drain [`Command`]s that describe the
//! frames to write to which client connection.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod auth;
pub mod channel_data;
mod client_message;
mod fingerprint;
mod server;

pub use channel_data::ChannelData;
pub use client_message::{
    Allocate, Binding, ChannelBind, ClientMessage, CreatePermission, Decoder, Refresh, Send,
};
pub use fingerprint::{append_fingerprint, strip_fingerprint, FingerprintError};
pub use server::{ClientId, Command, RelayAddr, Server};

use std::sync::LazyLock;
use stun_codec::rfc5389::attributes::{
    ErrorCode, MessageIntegrity, Nonce, Realm, Software, Username, XorMappedAddress,
};
use stun_codec::rfc5766::attributes::{
    ChannelNumber, Data, DontFragment, Lifetime, RequestedTransport, XorPeerAddress,
    XorRelayAddress,
};

pub static REALM: LazyLock<Realm> =
    LazyLock::new(|| Realm::new("bamgate".to_owned()).expect("static realm is less than 128 chars"));

pub static SOFTWARE: LazyLock<Software> = LazyLock::new(|| {
    Software::new(format!("bamgate-relay/{}", env!("CARGO_PKG_VERSION")))
        .expect("less than 128 chars")
});

/// Channel numbers valid for TURN channel bindings.
pub const CHANNEL_NUMBER_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFF;

// Define an enum of all attributes the relay understands.
stun_codec::define_attribute_enums!(
    Attribute,
    AttributeDecoder,
    AttributeEncoder,
    [
        MessageIntegrity,
        XorMappedAddress,
        ErrorCode,
        RequestedTransport,
        DontFragment,
        XorRelayAddress,
        XorPeerAddress,
        Lifetime,
        ChannelNumber,
        Data,
        Username,
        Realm,
        Nonce,
        Software
    ]
);

