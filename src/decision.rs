//! The Decision Process (RFC 4271 Section 9.1): the three phases that turn
//! each peer's Adj-RIB-In into the speaker-wide Loc-RIB and, from there, into
//! each peer's Adj-RIB-Out.
//!
//! Phase 2's tie-break and Phase 3's dissemination are both small, pure
//! functions over RIB snapshots, so the session/speaker tasks that drive
//! them stay free of selection logic.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::message::path::{AsPath, Data, Origin, PathAttributes, Type};
use crate::message::route::Ipv4Net;
use crate::message::update_builder::UpdateBuilder;
use crate::message::Update;
use crate::peer::PeerHandle;
use crate::rib::{LocRib, LocRibEntry};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

/// One peer's route for a destination, carrying everything Phase 1/2 need:
/// the attributes as received, the originating peer, and the degree of
/// preference Phase 1 assigned it.
#[derive(Clone)]
pub struct Candidate {
    pub attrs: PathAttributes,
    pub peer: PeerHandle,
    pub degree_of_preference: u32,
}

fn as_path(attrs: &PathAttributes) -> AsPath {
    match attrs.get(Type::AsPath) {
        Some(Data::AsPath(path)) => path.clone(),
        _ => AsPath::default(),
    }
}

fn origin_rank(attrs: &PathAttributes) -> u8 {
    match attrs.get(Type::Origin) {
        Some(Data::Origin(origin)) => *origin as u8,
        _ => Origin::Incomplete as u8,
    }
}

fn med(attrs: &PathAttributes, default: u32) -> u32 {
    match attrs.get(Type::MultiExitDisc) {
        Some(Data::MultiExitDisc(v)) => *v,
        _ => default,
    }
}

/// The AS immediately adjacent to us on this path: the leftmost hop of
/// AS_PATH, or the sending peer's own AS if the path carries none (a route
/// originated directly by that peer).
fn neighbor_as(candidate: &Candidate) -> u16 {
    as_path(&candidate.attrs)
        .first()
        .and_then(|seg| seg.asns.first().copied())
        .unwrap_or(candidate.peer.config.remote_asn)
}

/// Phase 1 (Section 9.1.1): assign a degree of preference to every route
/// received from every peer, dropping routes a peer's policy rejects
/// outright. Gathers a fresh snapshot of every peer's Adj-RIB-In.
#[must_use]
pub fn collect_candidates(peers: &[PeerHandle]) -> HashMap<Ipv4Net, Vec<Candidate>> {
    let mut by_prefix: HashMap<Ipv4Net, Vec<Candidate>> = HashMap::new();
    for peer in peers {
        for (prefix, attrs) in peer.adj_rib_in.snapshot() {
            if let Some(degree_of_preference) = peer.degree_of_preference(&attrs) {
                by_prefix.entry(prefix).or_default().push(Candidate {
                    attrs,
                    peer: peer.clone(),
                    degree_of_preference,
                });
            }
        }
    }
    by_prefix
}

/// Phase 2 (Section 9.1.2): select the single best route for a destination
/// out of its feasible candidates, or `None` if every candidate is
/// infeasible (e.g. every one loops back through us).
///
/// Candidates whose AS_PATH already contains `local_asn` are excluded first
/// (Section 9.1.2, loop detection) before the highest degree of preference
/// from Phase 1 and then the RFC 4271 Section 9.1.2.2 tie-break steps (a)
/// through (g) are applied in order, stopping as soon as one candidate
/// remains.
#[must_use]
pub fn select_best(local_asn: u16, candidates: Vec<Candidate>) -> Option<Candidate> {
    let mut feasible: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| !as_path(&c.attrs).contains_asn(local_asn))
        .collect();
    if feasible.len() <= 1 {
        return feasible.pop();
    }

    // Phase 1's output is the primary ranking signal feeding Phase 2.
    let max_degree = feasible.iter().map(|c| c.degree_of_preference).max()?;
    feasible.retain(|c| c.degree_of_preference == max_degree);
    if feasible.len() == 1 {
        return feasible.pop();
    }

    // (a) shortest AS_PATH.
    let min_len = feasible.iter().map(|c| as_path(&c.attrs).len_for_decision()).min()?;
    feasible.retain(|c| as_path(&c.attrs).len_for_decision() == min_len);
    if feasible.len() == 1 {
        return feasible.pop();
    }

    // (b) lowest ORIGIN (IGP < EGP < INCOMPLETE; the enum's discriminants
    // already carry that ordering).
    let min_origin = feasible.iter().map(origin_rank).min()?;
    feasible.retain(|c| origin_rank(c) == min_origin);
    if feasible.len() == 1 {
        return feasible.pop();
    }

    // (c) lowest MULTI_EXIT_DISC, but only among routes sharing the same
    // neighboring AS -- a route from a different neighbor AS is left alone
    // by this step rather than compared across ASes.
    let mut by_neighbor: HashMap<u16, Vec<usize>> = HashMap::new();
    for (i, c) in feasible.iter().enumerate() {
        by_neighbor.entry(neighbor_as(c)).or_default().push(i);
    }
    let mut keep = vec![true; feasible.len()];
    for idxs in by_neighbor.values() {
        if idxs.len() < 2 {
            continue;
        }
        let min_med = idxs
            .iter()
            .map(|&i| med(&feasible[i].attrs, feasible[i].peer.config.policy.default_med))
            .min()
            .expect("idxs non-empty");
        for &i in idxs {
            if med(&feasible[i].attrs, feasible[i].peer.config.policy.default_med) != min_med {
                keep[i] = false;
            }
        }
    }
    let mut kept = keep.into_iter();
    feasible.retain(|_| kept.next().unwrap_or(true));
    if feasible.len() == 1 {
        return feasible.pop();
    }

    // (d) prefer EBGP-learned routes over IBGP-learned ones.
    if feasible.iter().any(|c| !c.peer.config.is_ibgp()) {
        feasible.retain(|c| !c.peer.config.is_ibgp());
    }
    if feasible.len() == 1 {
        return feasible.pop();
    }

    // (e) lowest interior cost to NEXT_HOP: this speaker runs no IGP of its
    // own, so every candidate is equally (un)reachable by that measure and
    // the step passes through unchanged to (f).

    // (f) lowest BGP Identifier of the advertising speaker.
    let min_bgp_id = feasible.iter().filter_map(|c| c.peer.peer_bgp_id()).min();
    if let Some(min_id) = min_bgp_id {
        feasible.retain(|c| c.peer.peer_bgp_id().map_or(false, |id| id == min_id));
    }
    if feasible.len() == 1 {
        return feasible.pop();
    }

    // (g) lowest peer address, as the final tie-break.
    let min_addr = feasible.iter().map(|c| c.peer.config.remote_addr).min()?;
    feasible.retain(|c| c.peer.config.remote_addr == min_addr);
    feasible.pop()
}

/// Run Phase 1 and Phase 2 for every destination currently held by any
/// peer's Adj-RIB-In, installing or withdrawing Loc-RIB entries as the
/// winner changes, and reporting which destinations changed so Phase 3 can
/// disseminate just those.
#[must_use]
pub fn run_decision_process(local_asn: u16, peers: &[PeerHandle], loc_rib: &LocRib) -> Vec<Ipv4Net> {
    let by_prefix = collect_candidates(peers);
    let mut changed = Vec::new();
    let live_prefixes: std::collections::HashSet<Ipv4Net> = by_prefix.keys().copied().collect();

    for (prefix, candidates) in by_prefix {
        let winner = select_best(local_asn, candidates);
        let previous = loc_rib.get(prefix);
        match winner {
            Some(best) => {
                let entry = LocRibEntry {
                    attrs: best.attrs,
                    peer_addr: best.peer.config.remote_addr,
                    peer_asn: best.peer.config.remote_asn,
                    peer_bgp_id: best.peer.peer_bgp_id().unwrap_or(Ipv4Addr::UNSPECIFIED),
                    local_pref: best.degree_of_preference,
                };
                if previous.as_ref() != Some(&entry) {
                    loc_rib.insert(prefix, entry);
                    changed.push(prefix);
                }
            }
            None => {
                if previous.is_some() {
                    loc_rib.remove(prefix);
                    changed.push(prefix);
                }
            }
        }
    }

    // Destinations that disappeared from every Adj-RIB-In entirely never show
    // up in `by_prefix` (it only iterates what's still present), so a sweep
    // over the existing Loc-RIB entries catches the ones that need
    // withdrawing.
    for (prefix, _) in loc_rib.snapshot() {
        if !live_prefixes.contains(&prefix) {
            loc_rib.remove(prefix);
            changed.push(prefix);
        }
    }

    changed
}

/// Phase 3 (Section 9.1.3, Section 9.2): for one peer, decide what Loc-RIB
/// says about `prefixes` now, diff that against what was last sent
/// (`Peer::adj_rib_out`), and build the UPDATE messages needed to bring the
/// peer's view in line -- respecting IBGP split-horizon, this peer's export
/// policy, and per-peer attribute shaping (LOCAL_PREF only to IBGP peers,
/// next-hop-self to EBGP peers).
#[must_use]
pub fn disseminate_to_peer(
    local_asn: u16,
    local_bgp_id: Ipv4Addr,
    peer: &PeerHandle,
    loc_rib: &LocRib,
    prefixes: &[Ipv4Net],
) -> Vec<Update> {
    let mut to_withdraw = Vec::new();
    let mut to_announce = Vec::new();

    for &prefix in prefixes {
        let entry = loc_rib.get(prefix);
        let eligible = match &entry {
            Some(entry) => {
                let learned_via_ibgp = entry.peer_asn == local_asn;
                let to_ibgp_peer = peer.config.is_ibgp();
                !(learned_via_ibgp && to_ibgp_peer) && peer.config.policy.permits_export(prefix)
            }
            None => false,
        };

        if eligible {
            to_announce.push((prefix, entry.expect("eligible implies Some")));
        } else if peer.adj_rib_out.get(&prefix).is_some() {
            to_withdraw.push(prefix);
        }
    }

    for prefix in &to_withdraw {
        peer.adj_rib_out.remove(*prefix);
    }

    let mut updates = Vec::new();
    if !to_withdraw.is_empty() {
        updates.extend(UpdateBuilder::new().withdraw_routes(to_withdraw).build());
    }

    // Group announcements sharing identical outbound attributes into a
    // single UPDATE, since `UpdateBuilder` carries one attribute set per
    // call to `build`.
    let mut by_attrs: HashMap<(u8, Vec<u16>, Ipv4Addr, Option<u32>, Option<u32>), Vec<Ipv4Net>> =
        HashMap::new();
    for (prefix, entry) in &to_announce {
        let origin = origin_rank(&entry.attrs);
        let mut path = as_path(&entry.attrs);
        if !peer.config.is_ibgp() {
            path = path.prepended(local_asn);
        }
        let asns: Vec<u16> = path.iter().flat_map(|seg| seg.asns.clone()).collect();
        let next_hop = if peer.config.is_ibgp() {
            match entry.attrs.get(Type::NextHop) {
                Some(Data::NextHop(addr)) => *addr,
                _ => local_bgp_id,
            }
        } else {
            local_bgp_id
        };
        let local_pref = peer.config.is_ibgp().then_some(entry.local_pref);
        let med = peer.config.is_ibgp().then(|| match entry.attrs.get(Type::MultiExitDisc) {
            Some(Data::MultiExitDisc(v)) => *v,
            _ => 0,
        });
        by_attrs
            .entry((origin, asns, next_hop, local_pref, med))
            .or_default()
            .push(*prefix);
    }

    for ((origin, asns, next_hop, local_pref, med_value), prefixes) in by_attrs {
        let origin = if origin == Origin::Igp as u8 {
            Origin::Igp
        } else if origin == Origin::Egp as u8 {
            Origin::Egp
        } else {
            Origin::Incomplete
        };
        let mut as_path = AsPath::default();
        for asn in asns.into_iter().rev() {
            as_path = as_path.prepended(asn);
        }
        let mut builder = UpdateBuilder::new()
            .set_origin(origin)
            .set_as_path(as_path)
            .set_next_hop(next_hop)
            .add_routes(prefixes.clone());
        if let Some(local_pref) = local_pref {
            builder = builder.path_attribute(crate::message::path::Value {
                flags: crate::message::path::Flags::WELL_KNOWN,
                data: Data::LocalPref(local_pref),
            });
        }
        if let Some(med_value) = med_value {
            builder = builder.path_attribute(crate::message::path::Value {
                flags: crate::message::path::Flags::OPTIONAL_NON_TRANSITIVE,
                data: Data::MultiExitDisc(med_value),
            });
        }
        updates.extend(builder.build());
        for prefix in prefixes {
            let attrs = loc_rib.get(prefix).map(|e| e.attrs).unwrap_or_default();
            peer.adj_rib_out.insert(prefix, attrs);
        }
    }

    updates
}

/// Whether `peer`'s `MinRouteAdvertisementIntervalTimer` has elapsed, and if
/// so marks `now` as the new last-sent time. Call immediately before sending
/// the updates `disseminate_to_peer` built for this peer.
pub async fn min_route_advertisement_interval_elapsed(peer: &PeerHandle, now: Instant) -> bool {
    let mut last = peer.last_advertised.lock().await;
    let elapsed = last.map_or(true, |t| now.duration_since(t) >= peer.config.min_route_advertisement_interval);
    if elapsed {
        *last = Some(now);
    }
    elapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::path::{Flags, Value};
    use crate::peer::{Peer, PeerConfig, PeerPolicy};
    use std::sync::Arc;
    use std::time::Duration;

    fn net(addr: &str, len: u8) -> Ipv4Net {
        Ipv4Net::new(addr.parse().unwrap(), len)
    }

    fn peer(remote_asn: u16, remote_addr: &str, local_asn: u16) -> PeerHandle {
        Arc::new(Peer::new(PeerConfig {
            remote_asn,
            remote_addr: remote_addr.parse().unwrap(),
            local_asn,
            local_bgp_id: Ipv4Addr::new(192, 0, 2, 254),
            passive: false,
            hold_time: Duration::from_secs(90),
            delay_open: false,
            damp_peer_oscillations: false,
            min_route_advertisement_interval: Duration::from_secs(30),
            policy: PeerPolicy::default(),
        }))
    }

    fn attrs_with_path(asns: &[u16]) -> PathAttributes {
        let mut as_path = AsPath::default();
        for asn in asns.iter().rev() {
            as_path = as_path.prepended(*asn);
        }
        PathAttributes(vec![
            Value { flags: Flags::WELL_KNOWN, data: Data::Origin(Origin::Igp) },
            Value { flags: Flags::WELL_KNOWN, data: Data::AsPath(as_path) },
            Value { flags: Flags::WELL_KNOWN, data: Data::NextHop(Ipv4Addr::new(192, 0, 2, 1)) },
        ])
    }

    #[test]
    fn test_select_best_prefers_shorter_as_path() {
        let p1 = peer(65001, "192.0.2.1", 65000);
        let p2 = peer(65002, "192.0.2.2", 65000);
        let short = Candidate { attrs: attrs_with_path(&[65001]), peer: p1, degree_of_preference: 100 };
        let long = Candidate { attrs: attrs_with_path(&[65002, 65003]), peer: p2, degree_of_preference: 100 };
        let winner = select_best(65000, vec![long, short.clone()]).unwrap();
        assert_eq!(as_path(&winner.attrs).len_for_decision(), 1);
    }

    #[test]
    fn test_select_best_excludes_routes_with_local_asn_in_path() {
        let p1 = peer(65001, "192.0.2.1", 65000);
        let looped = Candidate { attrs: attrs_with_path(&[65001, 65000]), peer: p1, degree_of_preference: 100 };
        assert!(select_best(65000, vec![looped]).is_none());
    }

    #[test]
    fn test_select_best_prefers_higher_degree_of_preference() {
        let p1 = peer(65001, "192.0.2.1", 65000);
        let p2 = peer(65002, "192.0.2.2", 65000);
        let low = Candidate { attrs: attrs_with_path(&[65001]), peer: p1, degree_of_preference: 50 };
        let high = Candidate { attrs: attrs_with_path(&[65002]), peer: p2, degree_of_preference: 200 };
        let winner = select_best(65000, vec![low, high]).unwrap();
        assert_eq!(winner.degree_of_preference, 200);
    }

    #[test]
    fn test_select_best_falls_back_to_peer_address() {
        let p1 = peer(65001, "192.0.2.1", 65000);
        let p2 = peer(65001, "192.0.2.9", 65000);
        let a = Candidate { attrs: attrs_with_path(&[65001]), peer: p1, degree_of_preference: 100 };
        let b = Candidate { attrs: attrs_with_path(&[65001]), peer: p2, degree_of_preference: 100 };
        let winner = select_best(65000, vec![b, a]).unwrap();
        assert_eq!(winner.peer.config.remote_addr, Ipv4Addr::new(192, 0, 2, 1));
    }

    #[test]
    fn test_run_decision_process_installs_winner_into_loc_rib() {
        let p1 = peer(65001, "192.0.2.1", 65000);
        p1.adj_rib_in.insert(net("10.0.0.0", 8), attrs_with_path(&[65001]));
        let loc_rib = LocRib::new();
        let changed = run_decision_process(65000, &[p1], &loc_rib);
        assert_eq!(changed, vec![net("10.0.0.0", 8)]);
        assert!(loc_rib.get(net("10.0.0.0", 8)).is_some());
    }

    #[test]
    fn test_run_decision_process_withdraws_prefix_with_no_remaining_candidates() {
        let p1 = peer(65001, "192.0.2.1", 65000);
        p1.adj_rib_in.insert(net("10.0.0.0", 8), attrs_with_path(&[65001]));
        let loc_rib = LocRib::new();
        run_decision_process(65000, &[p1.clone()], &loc_rib);
        assert!(loc_rib.get(net("10.0.0.0", 8)).is_some());

        // The peer withdraws the prefix entirely; no candidate remains
        // anywhere, so the prefix never appears in a fresh `by_prefix` scan.
        p1.adj_rib_in.remove(net("10.0.0.0", 8));
        let changed = run_decision_process(65000, &[p1], &loc_rib);
        assert_eq!(changed, vec![net("10.0.0.0", 8)]);
        assert!(loc_rib.get(net("10.0.0.0", 8)).is_none());
    }

    #[test]
    fn test_disseminate_to_peer_respects_ibgp_split_horizon() {
        let source = peer(65000, "192.0.2.1", 65000); // IBGP source
        let dest = peer(65000, "192.0.2.2", 65000); // IBGP destination
        source.adj_rib_in.insert(net("10.0.0.0", 8), attrs_with_path(&[]));
        let loc_rib = LocRib::new();
        run_decision_process(65000, &[source], &loc_rib);
        let updates = disseminate_to_peer(65000, Ipv4Addr::new(192, 0, 2, 254), &dest, &loc_rib, &[net("10.0.0.0", 8)]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_disseminate_to_peer_builds_update_for_ebgp_peer() {
        let source = peer(65001, "192.0.2.1", 65000);
        source.adj_rib_in.insert(net("10.0.0.0", 8), attrs_with_path(&[65001]));
        let loc_rib = LocRib::new();
        run_decision_process(65000, &[source], &loc_rib);
        let dest = peer(65002, "192.0.2.3", 65000);
        let updates = disseminate_to_peer(65000, Ipv4Addr::new(192, 0, 2, 254), &dest, &loc_rib, &[net("10.0.0.0", 8)]);
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].nlri.is_empty());
        assert_eq!(dest.adj_rib_out.len(), 1);
    }
}
