//! Build UPDATE messages from a set of routes, splitting across multiple
//! messages when the combined NLRI/withdrawn-route set would overflow the
//! 4096-octet message cap (RFC 4271 Section 4.1).
//!
//! IPv4 unicast NLRI rides directly in the UPDATE body rather than a path
//! attribute, since this speaker carries no multiprotocol NLRI and so needs
//! no MP_REACH_NLRI/MP_UNREACH_NLRI split.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::path::{AsPath, Flags, Origin, PathAttributes, Value};
use super::route::{Ipv4Net, Routes};
use super::{Component, Update};
use std::net::Ipv4Addr;

/// Builder for one or more UPDATE messages sharing the same path attributes.
#[derive(Clone, Debug, Default)]
pub struct UpdateBuilder {
    withdrawn_routes: Routes,
    nlri: Routes,
    origin: Option<Origin>,
    as_path: AsPath,
    next_hop: Option<Ipv4Addr>,
    other_attrs: PathAttributes,
}

impl UpdateBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn withdraw_routes(mut self, routes: impl IntoIterator<Item = Ipv4Net>) -> Self {
        self.withdrawn_routes = routes.into();
        self
    }

    #[must_use]
    pub fn add_routes(mut self, routes: impl IntoIterator<Item = Ipv4Net>) -> Self {
        self.nlri = routes.into();
        self
    }

    #[must_use]
    pub fn set_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    #[must_use]
    pub fn set_as_path(mut self, as_path: AsPath) -> Self {
        self.as_path = as_path;
        self
    }

    #[must_use]
    pub fn set_next_hop(mut self, next_hop: Ipv4Addr) -> Self {
        self.next_hop = Some(next_hop);
        self
    }

    /// Carry an already-built attribute through unchanged (e.g. a preserved
    /// MULTI_EXIT_DISC or AGGREGATOR from the winning Adj-RIB-In entry).
    #[must_use]
    pub fn path_attribute(mut self, attr: Value) -> Self {
        self.other_attrs.0.push(attr);
        self
    }

    /// Assemble the mandatory well-known attributes shared by every UPDATE
    /// this builder produces.
    fn common_attributes(&self) -> PathAttributes {
        let mut attrs = self.other_attrs.clone();
        attrs.0.push(Value {
            flags: Flags::WELL_KNOWN,
            data: super::path::Data::Origin(self.origin.unwrap_or(Origin::Incomplete)),
        });
        attrs.0.push(Value {
            flags: Flags::WELL_KNOWN,
            data: super::path::Data::AsPath(self.as_path.clone()),
        });
        if let Some(next_hop) = self.next_hop {
            attrs.0.push(Value {
                flags: Flags::WELL_KNOWN,
                data: super::path::Data::NextHop(next_hop),
            });
        }
        attrs
    }

    /// Build one or more UPDATE messages, none exceeding the 4096-octet
    /// message cap, with withdrawn-only messages kept separate from
    /// messages carrying NLRI (so a pure withdrawal never has to carry the
    /// mandatory attributes it doesn't need).
    #[must_use]
    pub fn build(self) -> Vec<Update> {
        let common_attrs = self.common_attributes();
        let mut updates = Vec::new();

        if !self.withdrawn_routes.is_empty() {
            // 4096 - 19-octet header - 2 withdrawn-len - 2 total-path-attr-len
            let allowed = 4096 - 19 - 2 - 2;
            let splits = self.withdrawn_routes.split_routes_to_allowed_size_rev(allowed);
            let mut leftover = self.withdrawn_routes.0;
            for end in splits {
                let chunk = leftover.split_off(end);
                updates.push(Update {
                    withdrawn_routes: chunk.into(),
                    path_attributes: PathAttributes::default(),
                    nlri: Routes::default(),
                });
            }
        }

        if !self.nlri.is_empty() {
            let allowed = 4096 - 19 - 2 - 2 - common_attrs.encoded_len();
            let splits = self.nlri.split_routes_to_allowed_size_rev(allowed);
            let mut leftover = self.nlri.0;
            for end in splits {
                let chunk = leftover.split_off(end);
                updates.push(Update {
                    withdrawn_routes: Routes::default(),
                    path_attributes: common_attrs.clone(),
                    nlri: chunk.into(),
                });
            }
        }

        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(addr: &str, len: u8) -> Ipv4Net {
        Ipv4Net::new(addr.parse().unwrap(), len)
    }

    #[test]
    fn test_build_single_update_with_nlri_and_withdrawals() {
        let updates = UpdateBuilder::new()
            .set_origin(Origin::Igp)
            .set_as_path(AsPath::default().prepended(65000))
            .set_next_hop(Ipv4Addr::new(192, 0, 2, 1))
            .add_routes([net("10.0.0.0", 8)])
            .withdraw_routes([net("172.16.0.0", 12)])
            .build();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().any(|u| !u.nlri.is_empty()));
        assert!(updates.iter().any(|u| !u.withdrawn_routes.is_empty()));
    }

    #[test]
    fn test_build_empty_produces_no_messages() {
        let updates = UpdateBuilder::new().build();
        assert!(updates.is_empty());
    }

    #[test]
    fn test_build_splits_oversized_nlri() {
        let many: Vec<Ipv4Net> = (0..400u32)
            .map(|i| Ipv4Net::new(Ipv4Addr::from(i << 8), 24))
            .collect();
        let updates = UpdateBuilder::new()
            .set_origin(Origin::Igp)
            .set_as_path(AsPath::default().prepended(65000))
            .set_next_hop(Ipv4Addr::new(192, 0, 2, 1))
            .add_routes(many)
            .build();
        assert!(updates.len() > 1);
        for u in &updates {
            assert!(u.encoded_len() + 19 <= 4096);
        }
    }
}
