//! Per-neighbor configuration and persistent state (RFC 4271 Section 3.2)
//!
//! A [`Peer`] is created at configuration load and lives for the process
//! lifetime (spec Section 3's entity lifecycle); its [`AdjRibIn`]/
//! [`AdjRibOut`] tables are allocated here but only populated/cleared as the
//! peer's FSM moves through `initialize`/`release`. [`Fsm`](crate::fsm::Fsm)
//! is owned by the per-peer session task (`session`), not by `Peer` itself,
//! per the design note that Peer -> FSM is ownership and FSM -> Peer is a
//! back-reference: the session task holds both its own `Fsm` and an
//! `Arc<Peer>` back-reference, rather than `Peer` holding the `Fsm` it would
//! otherwise need a cycle to reach.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::message::path::{Data, Type};
use crate::message::route::Ipv4Net;
use crate::message::path::PathAttributes;
use crate::message::Message;
use crate::rib::{AdjRibIn, AdjRibOut};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Simple per-peer import/export policy knobs (spec Section 10.3): a
/// default degree of preference for EBGP routes lacking any other signal,
/// a default MED for routes missing MULTI_EXIT_DISC, and an optional
/// export allow-list.
#[derive(Clone, Debug)]
pub struct PeerPolicy {
    pub default_local_pref: u32,
    pub default_med: u32,
    /// If set, only these prefixes are advertised to the peer (Phase 3
    /// egress policy); `None` exports everything Loc-RIB offers, subject to
    /// the IBGP split-horizon rule.
    pub export_prefixes: Option<Vec<Ipv4Net>>,
}

impl Default for PeerPolicy {
    fn default() -> Self {
        Self {
            default_local_pref: 100,
            default_med: 0,
            export_prefixes: None,
        }
    }
}

impl PeerPolicy {
    /// Degree of preference assigned to an EBGP route under this policy.
    /// A real deployment would consult a route-map-like policy engine here;
    /// this speaker's Non-goals exclude policy configuration beyond these
    /// knobs, so every EBGP route is eligible at the configured default.
    #[must_use]
    pub fn import_degree(&self, _attrs: &PathAttributes) -> Option<u32> {
        Some(self.default_local_pref)
    }

    #[must_use]
    pub fn permits_export(&self, prefix: Ipv4Net) -> bool {
        match &self.export_prefixes {
            None => true,
            Some(allowed) => allowed.iter().any(|p| *p == prefix),
        }
    }
}

/// Static, per-peer configuration (spec Section 6's "configure local AS,
/// BGP Identifier, and a list of peers").
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub remote_asn: u16,
    pub remote_addr: Ipv4Addr,
    pub local_asn: u16,
    pub local_bgp_id: Ipv4Addr,
    /// `PassiveTCPEstablishment`: wait for an inbound connection rather than
    /// actively connecting.
    pub passive: bool,
    pub hold_time: Duration,
    pub delay_open: bool,
    pub damp_peer_oscillations: bool,
    /// `MinRouteAdvertisementIntervalTimer` (spec Section 4.5, Phase 3).
    pub min_route_advertisement_interval: Duration,
    pub policy: PeerPolicy,
}

impl PeerConfig {
    #[must_use]
    pub fn is_ibgp(&self) -> bool {
        self.remote_asn == self.local_asn
    }

    /// The default `MinRouteAdvertisementIntervalTimer`: 30s for EBGP, 5s
    /// for IBGP (RFC 4271 Section 9.2.1.1 suggested defaults).
    #[must_use]
    pub fn default_min_route_advertisement_interval(is_ibgp: bool) -> Duration {
        if is_ibgp {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(30)
        }
    }
}

/// A configured neighbor: its static configuration plus the Adj-RIB-In/Out
/// tables the Decision Process and this peer's session read and write.
pub struct Peer {
    pub config: PeerConfig,
    pub adj_rib_in: AdjRibIn,
    pub adj_rib_out: AdjRibOut,
    /// Timestamp of the last UPDATE sent to this peer, used to enforce
    /// `MinRouteAdvertisementIntervalTimer` in Phase 3 dissemination.
    pub last_advertised: Mutex<Option<Instant>>,
    /// The BGP Identifier this peer announced in its OPEN message, once the
    /// session has been established; used as the Phase 2 tie-break (RFC 4271
    /// Section 9.1.2.2, step f). Set by the session task, read by the
    /// Decision Process, so a plain `RwLock` (no `.await` needed) suffices.
    pub peer_bgp_id: RwLock<Option<Ipv4Addr>>,
    /// Whether this peer's FSM currently sits in `Established`; the Decision
    /// Process consults this before pushing Phase 3 UPDATEs onto
    /// `outbound_tx`, since dissemination to a peer whose session already
    /// dropped would just build up in a channel nobody reads.
    established: AtomicBool,
    /// Sending half of the channel the session task reads from to pull
    /// UPDATEs the Decision Process built; the receiving half is handed to
    /// the session task once, at startup, via `take_outbound_rx`.
    pub outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl Peer {
    #[must_use]
    pub fn new(config: PeerConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            config,
            adj_rib_in: AdjRibIn::new(),
            adj_rib_out: AdjRibOut::new(),
            last_advertised: Mutex::new(None),
            peer_bgp_id: RwLock::new(None),
            established: AtomicBool::new(false),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Take ownership of the outbound-message receiver. Panics if called
    /// more than once for a given peer, since only the one session task
    /// driving that peer's FSM should ever hold it.
    pub async fn take_outbound_rx(&self) -> mpsc::UnboundedReceiver<Message> {
        self.outbound_rx
            .lock()
            .await
            .take()
            .expect("take_outbound_rx called more than once")
    }

    pub fn set_established(&self, established: bool) {
        self.established.store(established, Ordering::Release);
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Record the BGP Identifier learned from this peer's OPEN message.
    pub fn set_peer_bgp_id(&self, id: Ipv4Addr) {
        *self.peer_bgp_id.write().expect("peer_bgp_id lock poisoned") = Some(id);
    }

    #[must_use]
    pub fn peer_bgp_id(&self) -> Option<Ipv4Addr> {
        *self.peer_bgp_id.read().expect("peer_bgp_id lock poisoned")
    }

    /// Forget the learned BGP Identifier, e.g. when the session drops back
    /// to Idle and the peer must re-announce it on the next OPEN.
    pub fn clear_peer_bgp_id(&self) {
        *self.peer_bgp_id.write().expect("peer_bgp_id lock poisoned") = None;
    }

    /// Degree of preference for a route learned from this peer (spec
    /// Section 4.5, Phase 1): LOCAL_PREF as carried for IBGP, policy-derived
    /// for EBGP. Returns `None` if the route is ineligible.
    #[must_use]
    pub fn degree_of_preference(&self, attrs: &PathAttributes) -> Option<u32> {
        if self.config.is_ibgp() {
            match attrs.get(Type::LocalPref) {
                Some(Data::LocalPref(v)) => Some(*v),
                _ => Some(self.config.policy.default_local_pref),
            }
        } else {
            self.config.policy.import_degree(attrs)
        }
    }
}

/// A shared handle to a [`Peer`]; cheap to clone, held by the per-peer
/// session task, the Decision Process, and the listener's collision logic.
pub type PeerHandle = Arc<Peer>;
