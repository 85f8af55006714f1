//! Wire-format round-trip tests, fixtures adapted from real BGP session
//! captures (trimmed of the multiprotocol/four-octet-ASN attributes this
//! speaker does not carry).

use super::capability::*;
use super::path::*;
use super::*;
use crate::test_support::hex_to_bytes;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_keepalive_message() {
    let data = hex_to_bytes("ffffffffffffffffffffffffffffffff001304");
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    let msg = codec.decode(&mut bmut).unwrap().unwrap();
    assert_eq!(msg, Message::Keepalive);
    let mut bmut = BytesMut::new();
    codec.encode(Message::Keepalive, &mut bmut).unwrap();
    assert_eq!(bmut.freeze(), data);
}

#[test]
fn test_open_message_no_opt_params() {
    let data = hex_to_bytes("ffffffffffffffffffffffffffffffff 001d 01 04 fd7d 0078 ac1706a5 00");
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    let msg = codec.decode(&mut bmut).unwrap().unwrap();
    let Message::Open(msg) = msg else {
        panic!("unexpected message type");
    };
    assert_eq!(msg.version, 4);
    assert_eq!(msg.asn, 64893);
    assert_eq!(msg.hold_time, 120);
    assert_eq!(msg.bgp_id, Ipv4Addr::new(172, 23, 6, 165));
    assert_eq!(msg.opt_params.len(), 0);
    let mut bmut = BytesMut::new();
    codec.encode(Message::Open(msg), &mut bmut).unwrap();
    assert_eq!(bmut.freeze(), data);
}

#[test]
fn test_open_message_zero_hold_time() {
    // HoldTime=0 means "never expect KEEPALIVE/UPDATE" and carries no
    // further restriction; validated separately by `is_valid_hold_time`.
    let data = hex_to_bytes("ffffffffffffffffffffffffffffffff 001d 01 04 0001 0000 01020304 00");
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    let msg = codec.decode(&mut bmut).unwrap().unwrap();
    let Message::Open(msg) = msg else {
        panic!("unexpected message type");
    };
    assert_eq!(msg.version, 4);
    assert_eq!(msg.asn, 1);
    assert_eq!(msg.hold_time, 0);
    assert_eq!(msg.bgp_id, Ipv4Addr::new(1, 2, 3, 4));
    assert!(msg.opt_params.is_empty());
    let mut bmut = BytesMut::new();
    codec.encode(Message::Open(msg), &mut bmut).unwrap();
    assert_eq!(bmut.freeze(), data);
}

#[test]
fn test_update_message() {
    let data = hex_to_bytes(
        "
    ffffffffffffffffffffffffffffffff 0039 02 0000 0012
    40 01 01 00
    40 02 04 0201 fd7d
    40 03 04 ac1706a5
    162dff30
    162dfe30
    162d7b80
    18cb0486",
    );
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    let msg = codec.decode(&mut bmut).unwrap().unwrap();
    let Message::Update(msg) = msg else {
        panic!("unexpected message type");
    };
    assert_eq!(msg.withdrawn_routes.len(), 0);
    assert_eq!(msg.path_attributes.len(), 3);
    assert_eq!(
        *msg.path_attributes.first().unwrap(),
        path::Value {
            flags: path::Flags(0x40),
            data: path::Data::Origin(Origin::Igp),
        }
    );
    assert_eq!(
        *msg.path_attributes.get(1).unwrap(),
        path::Value {
            flags: path::Flags(0x40),
            data: path::Data::AsPath(AsPath(vec![AsSegment {
                type_: AsSegmentType::AsSequence,
                asns: vec![0xfd7d],
            }])),
        }
    );
    assert_eq!(
        *msg.path_attributes.get(2).unwrap(),
        path::Value {
            flags: path::Flags(0x40),
            data: path::Data::NextHop(Ipv4Addr::new(172, 23, 6, 165)),
        }
    );
    assert_eq!(msg.nlri.len(), 4);
    let mut bmut = BytesMut::new();
    codec.encode(Message::Update(msg), &mut bmut).unwrap();
    assert_eq!(bmut.freeze(), data);
}

#[test]
fn test_withdraw_only_update_message() {
    // Total Path Attribute Length and NLRI are both empty; only a withdrawn
    // route is carried. No mandatory path attribute is required here.
    let data = hex_to_bytes(
        "
    ffffffffffffffffffffffffffffffff 001b 02 0004
    18cb0486
    0000",
    );
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    let msg = codec.decode(&mut bmut).unwrap().unwrap();
    let Message::Update(msg) = msg else {
        panic!("unexpected message type");
    };
    assert_eq!(msg.withdrawn_routes.len(), 1);
    assert_eq!(msg.path_attributes.len(), 0);
    assert_eq!(msg.nlri.len(), 0);
    let mut bmut = BytesMut::new();
    codec.encode(Message::Update(msg), &mut bmut).unwrap();
    assert_eq!(bmut.freeze(), data);
}

#[test]
fn test_notification_message() {
    let data = hex_to_bytes("ffffffffffffffffffffffffffffffff 0015 03 06 02");
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    let msg = codec.decode(&mut bmut).unwrap().unwrap();
    let Message::Notification(msg) = msg else {
        panic!("unexpected message type");
    };
    assert_eq!(msg.error_code, NotificationErrorCode::Cease);
    assert_eq!(msg.error_subcode, CeaseSubcode::AdministrativeShutdown as u8);
    assert_eq!(msg.data, Bytes::from_static(&[]));
    let mut bmut = BytesMut::new();
    codec.encode(Message::Notification(msg), &mut bmut).unwrap();
    assert_eq!(bmut.freeze(), data);
}

#[test]
fn test_rejects_bad_marker() {
    let data = hex_to_bytes("ffffffffffffffffffffffffffffff00001304");
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    assert!(matches!(codec.decode(&mut bmut), Err(Error::Marker)));
}

#[test]
fn test_unsupported_optional_parameter_rejected() {
    // OPEN with a bogus optional parameter type 99
    let data = hex_to_bytes("ffffffffffffffffffffffffffffffff 0020 01 04 fd7d 0078 ac1706a5 03 63 01 00");
    let mut bmut = bytes::BytesMut::from(&data[..]);
    let mut codec = Codec;
    assert!(matches!(codec.decode(&mut bmut), Err(Error::UnsupportedOptionalParameter(99))));
}
