//! Wire-level framing: the `Component` trait and the `tokio_util` codec for
//! the IPv4-only, no-capability-negotiation wire format this speaker
//! implements.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{Error, Message, Notification, Open, Update, KEEPALIVE_LEN, MARKER, MIN_NOTIFICATION_LEN, MIN_OPEN_LEN, MIN_UPDATE_LEN};
use bytes::{Buf, BufMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::net::Ipv4Addr;
use tokio_util::codec::{Decoder, Encoder};

/// BGP message codec: a length-delimited, marker-prefixed framing over
/// [`tokio_util::codec::Framed`].
#[derive(Copy, Clone, Debug, Default)]
pub struct BgpCodec;

impl Decoder for BgpCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 19 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([src[16], src[17]]) as usize;
        if !(KEEPALIVE_LEN..=4096).contains(&length) {
            return Err(Error::MessageLength(length, std::cmp::Ordering::Equal));
        }
        if src.len() < length {
            return Ok(None);
        }
        let marker = src.copy_to_bytes(16);
        if *marker != MARKER {
            return Err(Error::Marker);
        }
        let total_len = src.get_u16() as usize;
        let msg_type = src.get_u8();
        let msg_type = MessageType::from_u8(msg_type).ok_or(Error::MessageType(msg_type))?;
        let min_len = match msg_type {
            MessageType::Open => MIN_OPEN_LEN,
            MessageType::Update => MIN_UPDATE_LEN,
            MessageType::Notification => MIN_NOTIFICATION_LEN,
            MessageType::Keepalive => KEEPALIVE_LEN,
        };
        if total_len < min_len {
            return Err(Error::MessageLength(total_len, std::cmp::Ordering::Less));
        }
        let body_len = total_len - 19;
        let mut buf = src.split_to(body_len).freeze();
        let packet = match msg_type {
            MessageType::Open => Message::Open(Open::from_bytes(&mut buf)?),
            MessageType::Update => Message::Update(Update::from_bytes(&mut buf)?),
            MessageType::Notification => Message::Notification(Notification::from_bytes(&mut buf)?),
            MessageType::Keepalive => Message::Keepalive,
        };
        if buf.has_remaining() {
            log::debug!("trailing bytes after decoding {msg_type:?}: {buf:?}");
            return Err(Error::MessageLength(total_len, std::cmp::Ordering::Greater));
        }
        Ok(Some(packet))
    }
}

impl Encoder<Message> for BgpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&MARKER);
        let len_pos = dst.len();
        dst.put_u16(0);
        let len = match item {
            Message::Open(msg) => {
                dst.put_u8(MessageType::Open as u8);
                msg.to_bytes(dst)
            }
            Message::Update(msg) => {
                dst.put_u8(MessageType::Update as u8);
                msg.to_bytes(dst)
            }
            Message::Notification(msg) => {
                dst.put_u8(MessageType::Notification as u8);
                msg.to_bytes(dst)
            }
            Message::Keepalive => {
                dst.put_u8(MessageType::Keepalive as u8);
                0
            }
        };
        let len = u16::try_from(len + 19).expect("message length overflow");
        let len_bytes = len.to_be_bytes();
        dst[len_pos] = len_bytes[0];
        dst[len_pos + 1] = len_bytes[1];
        Ok(())
    }
}

/// BGP message type octet (RFC 4271 Section 4.1)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

/// A BGP wire component: something that can be read from and written to a
/// message body.
pub trait Component {
    /// Decode the component from a buffer.
    fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error>
    where
        Self: Sized;

    /// Encode the component into a buffer, returning the number of bytes written.
    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize;

    /// The length the component would encode to, without encoding it.
    fn encoded_len(&self) -> usize;
}

impl Component for Ipv4Addr {
    fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error> {
        Ok(Self::from(src.get_u32()))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u32(self.into());
        4
    }

    fn encoded_len(&self) -> usize {
        4
    }
}

macro_rules! impl_component_for_intn {
    ($typ:ty, $getter:ident, $putter:ident, $n:expr) => {
        impl Component for $typ {
            fn from_bytes(src: &mut bytes::Bytes) -> Result<Self, Error> {
                Ok(src.$getter())
            }

            fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
                dst.$putter(self);
                $n
            }

            fn encoded_len(&self) -> usize {
                $n
            }
        }
    };
}

impl_component_for_intn!(u8, get_u8, put_u8, 1);
impl_component_for_intn!(u16, get_u16, put_u16, 2);
impl_component_for_intn!(u32, get_u32, put_u32, 4);
