//! BGP path attributes (RFC 4271 Section 4.3, 5)
//!
//! Carries only the attributes a single-protocol, two-octet-ASN IPv4 speaker
//! needs: no RFC 4760 multiprotocol attributes (`MP_REACH_NLRI`/
//! `MP_UNREACH_NLRI`) and no RFC 6793 `AS4_PATH`/four-octet ASN
//! representation.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{Component, Error};
use bytes::{Buf, BufMut, Bytes};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::{net::Ipv4Addr, ops::Deref};

/// BGP path attributes, validated for mandatory-attribute presence and
/// duplicates once fully parsed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathAttributes(pub Vec<Value>);

impl Component for PathAttributes {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut attributes = Vec::new();
        let mut seen = Vec::new();
        while src.has_remaining() {
            let attr = Value::from_bytes(src)?;
            let type_octet = u8::from(&attr.data);
            if seen.contains(&type_octet) {
                return Err(Error::DuplicateAttribute(type_octet));
            }
            seen.push(type_octet);
            attributes.push(attr);
        }
        Ok(Self(attributes))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        self.0.into_iter().map(|attribute| attribute.to_bytes(dst)).sum()
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(Value::encoded_len).sum()
    }
}

impl Deref for PathAttributes {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PathAttributes {
    /// Find the first attribute of a given type, if present.
    #[must_use]
    pub fn get(&self, type_: Type) -> Option<&Data> {
        self.0
            .iter()
            .find(|v| u8::from(&v.data) == type_ as u8)
            .map(|v| &v.data)
    }

    /// Check that ORIGIN, AS_PATH and NEXT_HOP are all present. Only required
    /// when an UPDATE carries NLRI (RFC 4271 Section 4.3): a withdraw-only
    /// UPDATE has an empty Total Path Attribute Length and needs none of
    /// them, so callers gate this on `!nlri.is_empty()` rather than running
    /// it unconditionally from [`Self::from_bytes`].
    pub fn check_mandatory(&self) -> Result<(), Error> {
        for mandatory in [Type::Origin, Type::AsPath, Type::NextHop] {
            if self.get(mandatory).is_none() {
                return Err(Error::MissingWellKnownAttribute(mandatory as u8));
            }
        }
        Ok(())
    }
}

/// A single path attribute: flags plus typed data.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    pub flags: Flags,
    pub data: Data,
}

impl Component for Value {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let flags = Flags(src.get_u8());
        let type_ = src.get_u8();
        let len = if flags.is_extended_length() {
            src.get_u16() as usize
        } else {
            src.get_u8() as usize
        };
        if len > src.remaining() {
            return Err(Error::AttributeLengthError);
        }
        let mut body = src.split_to(len);
        if let Some(known) = Type::from_u8(type_) {
            if !known.flags_valid(flags) {
                return Err(Error::AttributeFlagsError(flags.0, type_));
            }
        }
        let data = match Type::from_u8(type_) {
            Some(Type::Origin) => Data::Origin(Origin::from_bytes(&mut body)?),
            Some(Type::AsPath) => Data::AsPath(AsPath::from_bytes(&mut body)?),
            Some(Type::NextHop) => Data::NextHop(Ipv4Addr::from_bytes(&mut body)?),
            Some(Type::MultiExitDisc) => Data::MultiExitDisc(body.get_u32()),
            Some(Type::LocalPref) => Data::LocalPref(body.get_u32()),
            Some(Type::AtomicAggregate) => Data::AtomicAggregate,
            Some(Type::Aggregator) => Data::Aggregator(Aggregator::from_bytes(&mut body)?),
            None => Data::Unsupported(type_, body),
        };
        Ok(Self { flags, data })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        dst.put_u8(self.flags.0);
        len += 1;
        dst.put_u8(u8::from(&self.data));
        len += 1;
        let len_pos = dst.len();
        let two_byte_len = if self.flags.is_extended_length() {
            dst.put_u16(0);
            len += 2;
            true
        } else {
            dst.put_u8(0);
            len += 1;
            false
        };
        let data_len = match self.data {
            Data::Origin(origin) => origin.to_bytes(dst),
            Data::AsPath(as_path) => as_path.to_bytes(dst),
            Data::NextHop(next_hop) => next_hop.to_bytes(dst),
            Data::MultiExitDisc(med) => med.to_bytes(dst),
            Data::LocalPref(local_pref) => local_pref.to_bytes(dst),
            Data::AtomicAggregate => 0,
            Data::Aggregator(agg) => agg.to_bytes(dst),
            Data::Unsupported(_, data) => {
                let len = data.len();
                dst.put_slice(&data);
                len
            }
        };
        if two_byte_len {
            dst[len_pos..len_pos + 2]
                .copy_from_slice(&(u16::try_from(data_len).expect("path attribute length overflow").to_be_bytes()));
        } else {
            dst[len_pos] = u8::try_from(data_len).expect("path attribute length overflow");
        }
        len + data_len
    }

    fn encoded_len(&self) -> usize {
        1 + 1
            + if self.flags.is_extended_length() { 2 } else { 1 }
            + match &self.data {
                Data::Origin(origin) => origin.encoded_len(),
                Data::AsPath(as_path) => as_path.encoded_len(),
                Data::NextHop(next_hop) => next_hop.encoded_len(),
                Data::MultiExitDisc(_) | Data::LocalPref(_) => 4,
                Data::AtomicAggregate => 0,
                Data::Aggregator(agg) => agg.encoded_len(),
                Data::Unsupported(_, data) => data.len(),
            }
    }
}

/// Path attribute flags octet (RFC 4271 Section 4.3)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Flags(pub u8);

impl Flags {
    /// Well-known, transitive, complete
    pub const WELL_KNOWN: Flags = Flags(0b0100_0000);
    /// Optional, transitive, complete
    pub const OPTIONAL_TRANSITIVE: Flags = Flags(0b1100_0000);
    /// Optional, non-transitive, complete
    pub const OPTIONAL_NON_TRANSITIVE: Flags = Flags(0b1000_0000);

    #[must_use]
    pub const fn is_optional(self) -> bool {
        self.0 & 0x80 != 0
    }

    #[must_use]
    pub const fn is_transitive(self) -> bool {
        self.0 & 0x40 != 0
    }

    #[must_use]
    pub const fn is_partial(self) -> bool {
        self.0 & 0x20 != 0
    }

    #[must_use]
    pub const fn is_extended_length(self) -> bool {
        self.0 & 0x10 != 0
    }
}

/// BGP path attribute data
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Data {
    Origin(Origin),
    AsPath(AsPath),
    /// BGP next hop (RFC 4271 Section 5.1.3)
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    Unsupported(u8, Bytes),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Type {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
}

impl Type {
    /// Whether a given flags octet is consistent with this attribute's
    /// well-known/optional and transitive/non-transitive category
    /// (RFC 4271 Section 4.3, see also Section 6.3's `AttributeFlagsError`).
    #[must_use]
    pub const fn flags_valid(self, flags: Flags) -> bool {
        match self {
            Self::Origin | Self::AsPath | Self::NextHop => !flags.is_optional() && flags.is_transitive(),
            Self::LocalPref | Self::AtomicAggregate => !flags.is_optional(),
            Self::MultiExitDisc => flags.is_optional() && !flags.is_transitive(),
            Self::Aggregator => flags.is_optional(),
        }
    }
}

impl From<&Data> for u8 {
    fn from(data: &Data) -> u8 {
        match data {
            Data::Origin(_) => Type::Origin as u8,
            Data::AsPath(_) => Type::AsPath as u8,
            Data::NextHop(_) => Type::NextHop as u8,
            Data::MultiExitDisc(_) => Type::MultiExitDisc as u8,
            Data::LocalPref(_) => Type::LocalPref as u8,
            Data::AtomicAggregate => Type::AtomicAggregate as u8,
            Data::Aggregator(_) => Type::Aggregator as u8,
            Data::Unsupported(type_, _) => *type_,
        }
    }
}

/// ORIGIN attribute value (RFC 4271 Section 5.1.1)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl Component for Origin {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let value = src.get_u8();
        Self::from_u8(value).ok_or(Error::InvalidOrigin(value))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self as u8);
        1
    }

    fn encoded_len(&self) -> usize {
        1
    }
}

/// AS_PATH attribute (RFC 4271 Section 5.1.2), two-octet AS numbers only.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AsPath(pub Vec<AsSegment>);

impl Component for AsPath {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut segments = Vec::new();
        while src.has_remaining() {
            segments.push(AsSegment::from_bytes(src)?);
        }
        Ok(Self(segments))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        self.0.into_iter().map(|segment| segment.to_bytes(dst)).sum()
    }

    fn encoded_len(&self) -> usize {
        self.0.iter().map(AsSegment::encoded_len).sum()
    }
}

impl Deref for AsPath {
    type Target = Vec<AsSegment>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsPath {
    /// Number of AS hops this path represents, for the decision process'
    /// `AS_PATH` length comparison (AS_SET segments count as one hop).
    #[must_use]
    pub fn len_for_decision(&self) -> usize {
        self.0
            .iter()
            .map(|seg| match seg.type_ {
                AsSegmentType::AsSequence | AsSegmentType::ConfedSequence => seg.asns.len(),
                AsSegmentType::AsSet | AsSegmentType::ConfedSet => 1,
            })
            .sum()
    }

    /// Whether a given AS number appears anywhere in the path (used for loop
    /// detection per Section 9.1.2).
    #[must_use]
    pub fn contains_asn(&self, asn: u16) -> bool {
        self.0.iter().any(|seg| seg.asns.contains(&asn))
    }

    /// Prepend an AS to the front of the path as a new, single-entry
    /// AS_SEQUENCE segment, merging into an existing leading sequence if one
    /// is present.
    #[must_use]
    pub fn prepended(mut self, asn: u16) -> Self {
        if let Some(first) = self.0.first_mut() {
            if first.type_ == AsSegmentType::AsSequence {
                first.asns.insert(0, asn);
                return self;
            }
        }
        self.0.insert(
            0,
            AsSegment {
                type_: AsSegmentType::AsSequence,
                asns: vec![asn],
            },
        );
        self
    }
}

/// AS path segment (RFC 4271 Section 4.3, 5.1.2)
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AsSegment {
    pub type_: AsSegmentType,
    pub asns: Vec<u16>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
#[repr(u8)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsSegmentType {
    AsSet = 1,
    AsSequence = 2,
    ConfedSequence = 3,
    ConfedSet = 4,
}

impl Component for AsSegment {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let type_ = src.get_u8();
        let len = src.get_u8() as usize;
        if len * 2 > src.remaining() {
            return Err(Error::MalformedAsPath);
        }
        let mut asns = Vec::with_capacity(len);
        for _ in 0..len {
            asns.push(src.get_u16());
        }
        Ok(Self {
            type_: AsSegmentType::from_u8(type_).ok_or(Error::MalformedAsPath)?,
            asns,
        })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u8(self.type_ as u8);
        dst.put_u8(u8::try_from(self.asns.len()).expect("AS segment length overflow"));
        for asn in &self.asns {
            dst.put_u16(*asn);
        }
        self.encoded_len()
    }

    fn encoded_len(&self) -> usize {
        2 + self.asns.len() * 2
    }
}

/// AGGREGATOR attribute (RFC 4271 Section 5.1.7)
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aggregator {
    pub asn: u16,
    pub ip: Ipv4Addr,
}

impl Component for Aggregator {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let asn = src.get_u16();
        let ip = Ipv4Addr::from_bytes(src)?;
        Ok(Self { asn, ip })
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        dst.put_u16(self.asn);
        self.ip.to_bytes(dst) + 2
    }

    fn encoded_len(&self) -> usize {
        4 + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::hex_to_bytes;

    #[test]
    fn test_origin() {
        let mut src = hex_to_bytes("40 01 01 00");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::Origin(Origin::Igp),
            }
        );
    }

    #[test]
    fn test_as_path() {
        let mut src = hex_to_bytes("40 0204 0201 fd7d");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::AsPath(AsPath(vec![AsSegment {
                    type_: AsSegmentType::AsSequence,
                    asns: vec![0xfd7d],
                }])),
            }
        );
    }

    #[test]
    fn test_next_hop() {
        let mut src = hex_to_bytes("40 03 04 7f000001");
        let pa = Value::from_bytes(&mut src).unwrap();
        assert_eq!(
            pa,
            Value {
                flags: Flags(0x40),
                data: Data::NextHop(Ipv4Addr::new(127, 0, 0, 1)),
            }
        );
    }

    #[test]
    fn test_bad_flags_rejected() {
        // ORIGIN sent as optional (0x80) instead of well-known (0x40)
        let mut src = hex_to_bytes("80 01 01 00");
        let err = Value::from_bytes(&mut src).unwrap_err();
        assert!(matches!(err, Error::AttributeFlagsError(0x80, 1)));
    }

    #[test]
    fn test_missing_mandatory_attribute() {
        // Only ORIGIN present, AS_PATH and NEXT_HOP missing
        let mut src = hex_to_bytes("40 01 01 00");
        let attrs = PathAttributes::from_bytes(&mut src).unwrap();
        let err = attrs.check_mandatory().unwrap_err();
        assert!(matches!(err, Error::MissingWellKnownAttribute(2)));
    }

    #[test]
    fn test_withdraw_only_update_skips_mandatory_check() {
        // An UPDATE with NLRI present still requires ORIGIN/AS_PATH/NEXT_HOP...
        let mut src = hex_to_bytes("40 01 01 00");
        let attrs = PathAttributes::from_bytes(&mut src).unwrap();
        assert!(attrs.check_mandatory().is_err());
        // ...but an empty attribute set parses fine on its own; callers only
        // enforce the mandatory check when NLRI is non-empty.
        let mut empty = Bytes::new();
        let attrs = PathAttributes::from_bytes(&mut empty).unwrap();
        assert!(attrs.0.is_empty());
    }

    #[test]
    fn test_as_path_len_for_decision() {
        let path = AsPath(vec![
            AsSegment {
                type_: AsSegmentType::AsSequence,
                asns: vec![100, 200],
            },
            AsSegment {
                type_: AsSegmentType::AsSet,
                asns: vec![300, 400, 500],
            },
        ]);
        assert_eq!(path.len_for_decision(), 3);
    }

    #[test]
    fn test_as_path_prepend_merges_leading_sequence() {
        let path = AsPath(vec![AsSegment {
            type_: AsSegmentType::AsSequence,
            asns: vec![200],
        }]);
        let path = path.prepended(100);
        assert_eq!(path.0.len(), 1);
        assert_eq!(path.0[0].asns, vec![100, 200]);
    }
}
