//! Operator-facing configuration surface.
//!
//! A small TOML file describing the local speaker identity and its
//! configured peers, loaded with `serde` + `toml` -- a file an operator
//! maintains across restarts rather than re-specifying on every invocation.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::peer::{PeerConfig, PeerPolicy};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Errors that can occur while loading a configuration file. Surfaced to the
/// operator interface; never crosses into the FSM/codec/RIB core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read configuration file {0}: {1}")]
    Read(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("peer {remote_addr} has hold time {hold_time}, which is neither 0 nor >= 3 (RFC 4271 Section 4.2)")]
    InvalidHoldTime { remote_addr: Ipv4Addr, hold_time: u16 },
}

/// Top-level configuration: this speaker's identity (local AS, BGP
/// Identifier) and its configured peers.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub local_as: u16,
    pub local_bgp_id: Ipv4Addr,
    /// Address to listen for inbound connections on; port 179 unless
    /// overridden (e.g. for running unprivileged in tests).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: std::net::IpAddr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub peer: Vec<PeerSpec>,
}

fn default_listen_addr() -> std::net::IpAddr {
    std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_listen_port() -> u16 {
    179
}

/// One `[[peer]]` table.
#[derive(Clone, Debug, Deserialize)]
pub struct PeerSpec {
    pub remote_as: u16,
    pub remote_addr: Ipv4Addr,
    /// `PassiveTCPEstablishment`: wait for the peer to connect to us
    /// instead of connecting out. Defaults to false (active).
    #[serde(default)]
    pub passive: bool,
    /// Hold Time this speaker proposes in its OPEN, in seconds; 0 or >= 3.
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    #[serde(default)]
    pub delay_open: bool,
    #[serde(default)]
    pub damp_peer_oscillations: bool,
    /// `MinRouteAdvertisementIntervalTimer` override, in seconds; defaults
    /// to the RFC 4271 Section 9.2.1.1 suggested value for the session kind
    /// (30s EBGP, 5s IBGP) when unset.
    pub min_route_advertisement_interval: Option<u64>,
    #[serde(default)]
    pub policy: PolicySpec,
}

fn default_hold_time() -> u16 {
    90
}

/// Import/export policy knobs (spec Section 10.3).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PolicySpec {
    #[serde(default = "default_local_pref")]
    pub default_local_pref: u32,
    #[serde(default)]
    pub default_med: u32,
    /// If present, only these prefixes (in `a.b.c.d/len` form) are exported
    /// to this peer.
    pub export_prefixes: Option<Vec<String>>,
}

fn default_local_pref() -> u32 {
    100
}

impl Config {
    /// Load and parse a configuration file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        for peer in &self.peer {
            if !crate::message::is_valid_hold_time(peer.hold_time) {
                return Err(Error::InvalidHoldTime {
                    remote_addr: peer.remote_addr,
                    hold_time: peer.hold_time,
                });
            }
        }
        Ok(())
    }

    /// Build the runtime [`PeerConfig`] for each configured peer.
    #[must_use]
    pub fn peer_configs(&self) -> Vec<PeerConfig> {
        self.peer
            .iter()
            .map(|spec| {
                let is_ibgp = spec.remote_as == self.local_as;
                let export_prefixes = spec.policy.export_prefixes.as_ref().map(|prefixes| {
                    prefixes
                        .iter()
                        .filter_map(|s| parse_ipv4_net(s))
                        .collect::<Vec<_>>()
                });
                PeerConfig {
                    remote_asn: spec.remote_as,
                    remote_addr: spec.remote_addr,
                    local_asn: self.local_as,
                    local_bgp_id: self.local_bgp_id,
                    passive: spec.passive,
                    hold_time: Duration::from_secs(u64::from(spec.hold_time)),
                    delay_open: spec.delay_open,
                    damp_peer_oscillations: spec.damp_peer_oscillations,
                    min_route_advertisement_interval: spec
                        .min_route_advertisement_interval
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| PeerConfig::default_min_route_advertisement_interval(is_ibgp)),
                    policy: PeerPolicy {
                        default_local_pref: spec.policy.default_local_pref,
                        default_med: spec.policy.default_med,
                        export_prefixes,
                    },
                }
            })
            .collect()
    }
}

fn parse_ipv4_net(s: &str) -> Option<crate::message::route::Ipv4Net> {
    let (addr, len) = s.split_once('/')?;
    Some(crate::message::route::Ipv4Net::new(addr.parse().ok()?, len.parse().ok()?))
}
