//! Property tests for the STUN/TURN wire codec.

use bamgate_relay::{channel_data, Attribute, ChannelData};
use bytecodec::{DecodeExt, EncodeExt};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5766::attributes::XorPeerAddress;
use stun_codec::rfc5766::methods::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH, SEND};
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, Method, TransactionId};

fn round_trip(message: Message<Attribute>) -> Message<Attribute> {
    let bytes = MessageEncoder::default()
        .encode_into_bytes(message)
        .expect("encoding must not fail");

    MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&bytes)
        .expect("decoding must not fail")
        .expect("message must not be broken")
}

#[test]
fn every_method_class_combination_round_trips() {
    let methods: [Method; 7] = [
        BINDING,
        ALLOCATE,
        REFRESH,
        CREATE_PERMISSION,
        CHANNEL_BIND,
        SEND,
        DATA,
    ];
    let classes = [
        MessageClass::Request,
        MessageClass::Indication,
        MessageClass::SuccessResponse,
        MessageClass::ErrorResponse,
    ];

    for method in methods {
        for class in classes {
            let transaction_id = TransactionId::new([0x42; 12]);
            let message = Message::<Attribute>::new(class, method, transaction_id);

            let decoded = round_trip(message);

            assert_eq!(decoded.method(), method);
            assert_eq!(decoded.class(), class);
            assert_eq!(decoded.transaction_id(), transaction_id);
        }
    }
}

fn arb_ip() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o))),
        any::<[u8; 16]>().prop_map(|o| IpAddr::V6(Ipv6Addr::from(o))),
    ]
}

proptest! {
    /// XOR-encoded addresses survive a round trip for any address, port and
    /// transaction id (the transaction id is part of the XOR keystream for
    /// IPv6 addresses).
    #[test]
    fn xor_address_round_trips(ip in arb_ip(), port in 0u16..=65535, tid in any::<[u8; 12]>()) {
        let addr = SocketAddr::new(ip, port);
        let transaction_id = TransactionId::new(tid);

        let mut message =
            Message::<Attribute>::new(MessageClass::Indication, SEND, transaction_id);
        message.add_attribute(XorPeerAddress::new(addr));

        let decoded = round_trip(message);

        prop_assert_eq!(
            decoded.get_attribute::<XorPeerAddress>().unwrap().address(),
            addr
        );
    }

    /// ChannelData frames are padded to 4 bytes with the length field
    /// counting the payload only.
    #[test]
    fn channel_data_padding(len in 1usize..=1500, channel in 0x4000u16..=0x7FFF) {
        let payload = vec![0xAB; len];

        let frame = channel_data::make(channel, &payload);

        prop_assert_eq!(frame.len(), 4 + len.div_ceil(4) * 4);
        prop_assert_eq!(u16::from_be_bytes([frame[2], frame[3]]) as usize, len);

        let parsed = ChannelData::parse(&frame).unwrap();
        prop_assert_eq!(parsed.channel(), channel);
        prop_assert_eq!(parsed.data(), &payload[..]);
    }
}
