//! Routing Information Bases (RFC 4271 Section 3.2): per-peer Adj-RIB-In and
//! Adj-RIB-Out, and the speaker-wide Loc-RIB, each a lock-guarded table
//! shared between a peer's session task and the Decision Process.

// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod trie;

use crate::message::path::PathAttributes;
use crate::message::route::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;
use trie::Trie;

/// A route as held in the Adj-RIB-In/Out: the path attributes received with
/// or to be sent with it, keyed externally by destination prefix.
pub type PeerRib = RwLock<HashMap<Ipv4Net, PathAttributes>>;

/// Routes learned from a single peer, unprocessed by the Decision Process
/// (RFC 4271 Section 3.2).
#[derive(Default)]
pub struct AdjRibIn(PeerRib);

/// Routes selected for advertisement to a single peer, after Phase 3 of the
/// Decision Process (RFC 4271 Section 3.2, 9.2).
#[derive(Default)]
pub struct AdjRibOut(PeerRib);

macro_rules! impl_peer_rib {
    ($ty:ident) => {
        impl $ty {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            /// Insert or replace the route for `prefix`.
            pub fn insert(&self, prefix: Ipv4Net, attrs: PathAttributes) {
                self.0.write().expect("rib lock poisoned").insert(prefix, attrs);
            }

            /// Remove the route for `prefix`, if present.
            pub fn remove(&self, prefix: Ipv4Net) -> Option<PathAttributes> {
                self.0.write().expect("rib lock poisoned").remove(&prefix)
            }

            /// Clear every route, e.g. when a session drops back to Idle.
            pub fn clear(&self) {
                self.0.write().expect("rib lock poisoned").clear();
            }

            /// A point-in-time copy of every (prefix, attributes) pair.
            #[must_use]
            pub fn snapshot(&self) -> Vec<(Ipv4Net, PathAttributes)> {
                self.0
                    .read()
                    .expect("rib lock poisoned")
                    .iter()
                    .map(|(p, a)| (*p, a.clone()))
                    .collect()
            }

            #[must_use]
            pub fn get(&self, prefix: &Ipv4Net) -> Option<PathAttributes> {
                self.0.read().expect("rib lock poisoned").get(prefix).cloned()
            }

            #[must_use]
            pub fn len(&self) -> usize {
                self.0.read().expect("rib lock poisoned").len()
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }
        }
    };
}

impl_peer_rib!(AdjRibIn);
impl_peer_rib!(AdjRibOut);

/// A route installed in the Loc-RIB: the winning attributes from Phase 2 of
/// the Decision Process, plus the provenance needed for Phase 3 dissemination
/// and for tie-breaking future candidates (RFC 4271 Section 9.1.2).
#[derive(Clone, Debug, PartialEq)]
pub struct LocRibEntry {
    pub attrs: PathAttributes,
    /// The neighbor this route was received from.
    pub peer_addr: Ipv4Addr,
    /// That neighbor's AS, used to distinguish internal vs. external routes.
    pub peer_asn: u16,
    /// That neighbor's BGP Identifier, used as the final decision-process
    /// tie-break (RFC 4271 Section 9.1.2.2, step e).
    pub peer_bgp_id: Ipv4Addr,
    /// The degree of preference computed in Phase 1, carried along so Phase
    /// 3 can set LOCAL_PREF when re-advertising this route to IBGP peers
    /// (RFC 4271 Section 5.1.5: never sent to EBGP peers).
    pub local_pref: u32,
}

/// The speaker-wide Loc-RIB (RFC 4271 Section 3.2): one best route per
/// destination, as selected by the Decision Process, stored in a
/// longest-prefix-match trie so forwarding lookups and route withdrawal can
/// both use it directly.
#[derive(Default)]
pub struct LocRib(RwLock<Trie<LocRibEntry>>);

impl LocRib {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the winning route for `prefix`.
    pub fn insert(&self, prefix: Ipv4Net, entry: LocRibEntry) {
        self.0.write().expect("rib lock poisoned").insert(prefix, entry);
    }

    /// Remove the route for `prefix` (e.g. it lost all candidates).
    pub fn remove(&self, prefix: Ipv4Net) -> Option<LocRibEntry> {
        self.0.write().expect("rib lock poisoned").remove(prefix)
    }

    #[must_use]
    pub fn get(&self, prefix: Ipv4Net) -> Option<LocRibEntry> {
        self.0.read().expect("rib lock poisoned").get(prefix).cloned()
    }

    /// Longest-prefix match against a forwarding destination.
    #[must_use]
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<LocRibEntry> {
        self.0.read().expect("rib lock poisoned").lookup(addr).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().expect("rib lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of every installed (prefix, entry) pair, used to
    /// find destinations that dropped out of every peer's Adj-RIB-In
    /// entirely and so never resurface in a fresh decision-process pass.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Ipv4Net, LocRibEntry)> {
        self.0
            .read()
            .expect("rib lock poisoned")
            .entries()
            .into_iter()
            .map(|(p, e)| (p, e.clone()))
            .collect()
    }
}
