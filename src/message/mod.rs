//! BGP message structures (RFC 4271 Section 4)
//!
//! Structs here represent the data instead of the on-wire format; see
//! [`endec`] for the byte-level framing and the `Component` trait that
//! every substructure implements.

// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod capability;
mod endec;
pub mod path;
pub mod route;
pub mod update_builder;

#[cfg(test)]
mod tests;

pub use endec::BgpCodec as Codec;
pub use endec::Component;

use bytes::{Buf, BufMut, Bytes};
use capability::OptionalParameters;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use path::PathAttributes;
use route::Routes;
use std::net::Ipv4Addr;

/// Supported BGP version (RFC 4271 only; no RFC 6793 four-octet ASN support)
pub const BGP_VERSION: u8 = 4;

/// The all-ones marker that begins every BGP message
pub const MARKER: [u8; 16] = [0xff; 16];

/// Minimum total message length for each message type, header included
pub const MIN_OPEN_LEN: usize = 29;
pub const MIN_UPDATE_LEN: usize = 23;
pub const MIN_NOTIFICATION_LEN: usize = 21;
pub const KEEPALIVE_LEN: usize = 19;

/// Errors produced while decoding or encoding a BGP message.
///
/// Each variant maps to a NOTIFICATION error code/subcode pair; see
/// [`Error::to_notification`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid or missing marker")]
    Marker,
    #[error("invalid message length {0} (expected {1:?})")]
    MessageLength(usize, std::cmp::Ordering),
    #[error("invalid message type {0}")]
    MessageType(u8),
    #[error("unsupported OPEN version {0}")]
    UnsupportedVersion(u8),
    #[error("unacceptable peer AS {0}")]
    BadPeerAs(u16),
    #[error("invalid BGP identifier {0}")]
    BadBgpIdentifier(Ipv4Addr),
    #[error("unacceptable hold time {0}")]
    UnacceptableHoldTime(u16),
    #[error("unsupported optional parameter type {0}")]
    UnsupportedOptionalParameter(u8),
    #[error("path attribute flags {0:#04x} inconsistent with type {1}")]
    AttributeFlagsError(u8, u8),
    #[error("path attribute length exceeds remaining message body")]
    AttributeLengthError,
    #[error("missing well-known mandatory attribute {0}")]
    MissingWellKnownAttribute(u8),
    #[error("duplicate well-known attribute {0}")]
    DuplicateAttribute(u8),
    #[error("invalid ORIGIN value {0}")]
    InvalidOrigin(u8),
    #[error("invalid NEXT_HOP {0}")]
    InvalidNextHop(Ipv4Addr),
    #[error("malformed AS_PATH")]
    MalformedAsPath,
    #[error("invalid network field")]
    InvalidNetworkField,
    #[error("unknown NOTIFICATION error code {0}")]
    UnknownErrorCode(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map a decode error to the NOTIFICATION (error code, error subcode) pair
    /// it must be reported with, per RFC 4271 Section 6.
    #[must_use]
    pub fn to_notification(&self) -> (NotificationErrorCode, u8) {
        use NotificationErrorCode as C;
        match self {
            Self::Marker => (C::MessageHeaderError, MessageHeaderErrorSubcode::ConnectionNotSynchronized as u8),
            Self::MessageLength(..) => (C::MessageHeaderError, MessageHeaderErrorSubcode::BadMessageLength as u8),
            Self::MessageType(_) => (C::MessageHeaderError, MessageHeaderErrorSubcode::BadMessageType as u8),
            Self::UnsupportedVersion(_) => (C::OpenMessageError, OpenMessageErrorSubcode::UnsupportedVersionNumber as u8),
            Self::BadPeerAs(_) => (C::OpenMessageError, OpenMessageErrorSubcode::BadPeerAs as u8),
            Self::BadBgpIdentifier(_) => (C::OpenMessageError, OpenMessageErrorSubcode::BadBgpIdentifier as u8),
            Self::UnacceptableHoldTime(_) => (C::OpenMessageError, OpenMessageErrorSubcode::UnacceptableHoldTime as u8),
            Self::UnsupportedOptionalParameter(_) => (C::OpenMessageError, OpenMessageErrorSubcode::UnsupportedOptionalParameter as u8),
            Self::AttributeFlagsError(..) => (C::UpdateMessageError, UpdateMessageErrorSubcode::AttributeFlagsError as u8),
            Self::AttributeLengthError => (C::UpdateMessageError, UpdateMessageErrorSubcode::AttributeLengthError as u8),
            Self::MissingWellKnownAttribute(_) => (C::UpdateMessageError, UpdateMessageErrorSubcode::MissingWellKnownAttribute as u8),
            Self::DuplicateAttribute(_) => (C::UpdateMessageError, UpdateMessageErrorSubcode::MalformedAttributeList as u8),
            Self::InvalidOrigin(_) => (C::UpdateMessageError, UpdateMessageErrorSubcode::InvalidOriginAttribute as u8),
            Self::InvalidNextHop(_) => (C::UpdateMessageError, UpdateMessageErrorSubcode::InvalidNextHopAttribute as u8),
            Self::MalformedAsPath => (C::UpdateMessageError, UpdateMessageErrorSubcode::MalformedAsPath as u8),
            Self::InvalidNetworkField => (C::UpdateMessageError, UpdateMessageErrorSubcode::InvalidNetworkField as u8),
            Self::UnknownErrorCode(_) | Self::Io(_) => (C::Cease, CeaseSubcode::OtherConfigurationChange as u8),
        }
    }
}

/// BGP message (RFC 4271 Section 4.1)
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    Keepalive,
}

/// BGP OPEN message (RFC 4271 Section 4.2)
#[derive(Clone, Debug, PartialEq)]
pub struct Open {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_id: Ipv4Addr,
    pub opt_params: OptionalParameters,
}

impl Component for Open {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let version = src.get_u8();
        let asn = src.get_u16();
        let hold_time = src.get_u16();
        let bgp_id = Ipv4Addr::from(src.get_u32());
        let opt_params = OptionalParameters::from_bytes(src)?;
        Ok(Self {
            version,
            asn,
            hold_time,
            bgp_id,
            opt_params,
        })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        len += self.version.to_bytes(dst);
        len += self.asn.to_bytes(dst);
        len += self.hold_time.to_bytes(dst);
        len += self.bgp_id.to_bytes(dst);
        len += self.opt_params.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        1 + 2 + 2 + 4 + self.opt_params.encoded_len()
    }
}

impl Open {
    /// Build an OPEN with no optional parameters, as this speaker always sends
    /// (see spec Section 6: "No capability advertisements are required").
    #[must_use]
    pub fn new(asn: u16, hold_time: u16, bgp_id: Ipv4Addr) -> Self {
        Self {
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_id,
            opt_params: OptionalParameters::default(),
        }
    }
}

/// Returns true for Hold Time values RFC 4271 Section 4.2 allows (0, or >= 3)
#[must_use]
pub const fn is_valid_hold_time(hold_time: u16) -> bool {
    hold_time == 0 || hold_time >= 3
}

/// BGP UPDATE message (RFC 4271 Section 4.3)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    pub withdrawn_routes: Routes,
    pub path_attributes: PathAttributes,
    pub nlri: Routes,
}

impl Component for Update {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let withdrawn_len = src.get_u16() as usize;
        if withdrawn_len > src.remaining() {
            return Err(Error::InvalidNetworkField);
        }
        let mut wdr_buf = src.split_to(withdrawn_len);
        let withdrawn_routes = Routes::from_bytes(&mut wdr_buf)?;
        let tpa_len = src.get_u16() as usize;
        if tpa_len > src.remaining() {
            return Err(Error::AttributeLengthError);
        }
        let mut tpa_buf = src.split_to(tpa_len);
        let path_attributes = PathAttributes::from_bytes(&mut tpa_buf)?;
        let nlri = Routes::from_bytes(src)?;
        if !nlri.is_empty() {
            path_attributes.check_mandatory()?;
        }
        Ok(Self {
            withdrawn_routes,
            path_attributes,
            nlri,
        })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        let wdr_len_pos = dst.len();
        len += 0u16.to_bytes(dst); // Placeholder for withdrawn routes length
        let wdr_len = self.withdrawn_routes.to_bytes(dst);
        len += wdr_len;
        dst[wdr_len_pos..wdr_len_pos + 2]
            .copy_from_slice(&(u16::try_from(wdr_len).expect("withdrawn routes length overflow").to_be_bytes()));
        let tpa_len_pos = dst.len();
        len += 0u16.to_bytes(dst); // Placeholder for total path attributes length
        let tpa_len = self.path_attributes.to_bytes(dst);
        len += tpa_len;
        dst[tpa_len_pos..tpa_len_pos + 2]
            .copy_from_slice(&(u16::try_from(tpa_len).expect("total path attributes length overflow").to_be_bytes()));
        len += self.nlri.to_bytes(dst);
        len
    }

    fn encoded_len(&self) -> usize {
        2 + self.withdrawn_routes.encoded_len() + 2 + self.path_attributes.encoded_len() + self.nlri.encoded_len()
    }
}

/// BGP NOTIFICATION message (RFC 4271 Section 4.5)
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub error_code: NotificationErrorCode,
    pub error_subcode: u8,
    pub data: Bytes,
}

impl Component for Notification {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let error_code = src.get_u8();
        let error_subcode = src.get_u8();
        let data = src.copy_to_bytes(src.remaining());
        Ok(Self {
            error_code: NotificationErrorCode::from_u8(error_code).ok_or(Error::UnknownErrorCode(error_code))?,
            error_subcode,
            data,
        })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        len += (self.error_code as u8).to_bytes(dst);
        len += self.error_subcode.to_bytes(dst);
        len += self.data.len();
        dst.put_slice(&self.data);
        len
    }

    fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }
}

impl Notification {
    #[must_use]
    pub fn new(error_code: NotificationErrorCode, error_subcode: u8, data: Bytes) -> Self {
        Self {
            error_code,
            error_subcode,
            data,
        }
    }

    /// Build a NOTIFICATION directly from a decode [`Error`]
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        let (code, subcode) = err.to_notification();
        Self::new(code, subcode, Bytes::new())
    }
}

/// NOTIFICATION error codes (RFC 4271 Section 4.5)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum NotificationErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
}

/// NOTIFICATION error subcodes for `MessageHeaderError`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum MessageHeaderErrorSubcode {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

/// NOTIFICATION error subcodes for `OpenMessageError`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum OpenMessageErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
}

/// NOTIFICATION error subcodes for `UpdateMessageError`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum UpdateMessageErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    AsRoutingLoop = 7,
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// NOTIFICATION error subcodes for `Cease`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
pub enum CeaseSubcode {
    MaximumNumberOfPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
}
