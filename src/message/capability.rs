//! OPEN message optional parameters (RFC 4271 Section 4.2)
//!
//! This speaker does not negotiate capabilities (no capability advertisements
//! are required); optional parameters are parsed as opaque TLVs only so that
//! an OPEN carrying them can still be validated and, if necessary, rejected
//! with `UnsupportedOptionalParameter` rather than a framing error.
//!
//! No RFC 5492 capability negotiation (`MultiProtocol`, `ExtendedNextHop`,
//! `FourOctetAsNumber`) is implemented; this speaker never sends or
//! understands any capability.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{Component, Error};
use bytes::{Buf, BufMut, Bytes};
use std::ops::Deref;

/// List of BGP OPEN optional parameters, kept opaque
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OptionalParameters(pub Vec<OptionalParameterValue>);

impl Component for OptionalParameters {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let len = src.get_u8() as usize;
        if len != src.remaining() {
            return Err(Error::InvalidNetworkField);
        }
        let mut opt_params = Vec::new();
        while src.has_remaining() {
            opt_params.push(OptionalParameterValue::from_bytes(src)?);
        }
        Ok(Self(opt_params))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let length_pos = dst.len();
        dst.put_u8(0);
        let mut len = 0;
        for param in self.0 {
            len += param.to_bytes(dst);
        }
        dst[length_pos] = u8::try_from(len).expect("optional parameters length overflow");
        len + 1
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(Component::encoded_len).sum::<usize>() + 1
    }
}

impl Deref for OptionalParameters {
    type Target = Vec<OptionalParameterValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A single OPEN optional parameter, type 2 (Capabilities) kept as a raw
/// sub-TLV list; any other type is rejected at decode time.
#[derive(Clone, Debug, PartialEq)]
pub struct OptionalParameterValue {
    pub param_type: u8,
    pub data: Bytes,
}

const OPT_PARAM_CAPABILITIES: u8 = 2;

impl Component for OptionalParameterValue {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let param_type = src.get_u8();
        let param_len = src.get_u8() as usize;
        if param_len > src.remaining() {
            return Err(Error::InvalidNetworkField);
        }
        if param_type != OPT_PARAM_CAPABILITIES {
            return Err(Error::UnsupportedOptionalParameter(param_type));
        }
        let data = src.copy_to_bytes(param_len);
        Ok(Self { param_type, data })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self.param_type);
        dst.put_u8(u8::try_from(self.data.len()).expect("optional parameter length overflow"));
        dst.put_slice(&self.data);
        2 + self.data.len()
    }

    fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }
}
