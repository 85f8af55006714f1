//! NLRI / withdrawn routes encoding (RFC 4271 Section 4.3)
//!
//! IPv4 prefixes only (a single `Ipv4Net`, rather than a per-address-family
//! split), since this speaker carries no multiprotocol NLRI.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{Component, Error};
use bytes::{Buf, BufMut, Bytes};
use std::net::Ipv4Addr;
use std::ops::Deref;

/// Compute ⌈prefix_len / 8⌉, the number of octets RFC 4271 Section 4.3
/// uses to encode a prefix.
#[must_use]
pub fn n_prefix_octets(prefix_len: u8) -> usize {
    usize::from((prefix_len + 7) / 8)
}

/// An IPv4 prefix, as carried (without its length octet) inside a [`Value`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Net {
    #[must_use]
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

/// One NLRI/withdrawn-route entry: a prefix length and the minimal number of
/// octets needed to represent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub prefix_len: u8,
    pub prefix: Bytes,
}

impl Value {
    /// Decode this entry's prefix into a full `Ipv4Addr` with the trailing
    /// host bits zeroed.
    #[must_use]
    pub fn to_ipv4_net(&self) -> Ipv4Net {
        let mut octets = [0u8; 4];
        octets[..self.prefix.len()].copy_from_slice(&self.prefix);
        Ipv4Net::new(Ipv4Addr::from(octets), self.prefix_len)
    }
}

impl From<Ipv4Net> for Value {
    fn from(net: Ipv4Net) -> Self {
        let n = n_prefix_octets(net.prefix_len);
        let prefix = Bytes::copy_from_slice(&net.addr.octets()[..n]);
        Self {
            prefix_len: net.prefix_len,
            prefix,
        }
    }
}

/// A compact list of routes (NLRI or withdrawn routes), without a
/// surrounding length field -- the caller reads until the buffer is
/// exhausted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routes(pub Vec<Value>);

impl Component for Routes {
    fn from_bytes(src: &mut Bytes) -> Result<Self, Error> {
        let mut routes = Vec::new();
        while src.has_remaining() {
            let prefix_len = src.get_u8();
            if prefix_len > 32 {
                return Err(Error::InvalidNetworkField);
            }
            let n = n_prefix_octets(prefix_len);
            if n > src.remaining() {
                return Err(Error::InvalidNetworkField);
            }
            let prefix = src.split_to(n);
            routes.push(Value { prefix_len, prefix });
        }
        Ok(Self(routes))
    }

    fn to_bytes(self, dst: &mut bytes::BytesMut) -> usize {
        let mut len = 0;
        for route in self.0 {
            dst.put_u8(route.prefix_len);
            dst.put_slice(&route.prefix);
            len += 1 + route.prefix.len();
        }
        len
    }

    fn encoded_len(&self) -> usize {
        Self::slice_encoded_len(&self.0)
    }
}

impl Deref for Routes {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<I, T> From<I> for Routes
where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
{
    fn from(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl Routes {
    fn slice_encoded_len(routes: &[Value]) -> usize {
        routes.iter().map(|r| 1 + r.prefix.len()).sum()
    }

    /// Find split points so each resulting group of routes encodes to at
    /// most `allowed_size` bytes -- used when an UPDATE's NLRI/withdrawn
    /// routes would otherwise overflow the message size limit.
    ///
    /// Returns the right boundary of each group (`vec![len]` if no split is
    /// needed); returns an empty vector if even a single route cannot fit.
    #[must_use]
    pub fn split_routes_to_allowed_size_each(&self, allowed_size: usize) -> Vec<usize> {
        let len = self.len();
        let mut split_points = Vec::new();
        let mut start = 0;
        let mut to_keep_each = len;
        while start < self.len() {
            let mut end = len.min(start + to_keep_each);
            let mut encoded_len = Self::slice_encoded_len(&self[start..end]);
            while encoded_len > allowed_size {
                to_keep_each /= 2;
                if to_keep_each == 0 {
                    return Vec::new();
                }
                end = len.min(start + to_keep_each);
                encoded_len = Self::slice_encoded_len(&self[start..end]);
            }
            split_points.push(end);
            start += to_keep_each;
        }
        split_points
    }

    /// Like [`Self::split_routes_to_allowed_size_each`], but returns left
    /// boundaries in reverse order, suitable for repeated `Vec::split_off`.
    #[must_use]
    pub fn split_routes_to_allowed_size_rev(&self, allowed_size: usize) -> Vec<usize> {
        let mut split_points = self.split_routes_to_allowed_size_each(allowed_size);
        split_points.pop();
        split_points.reverse();
        split_points.push(0);
        split_points
    }
}
