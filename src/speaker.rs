//! The top-level BGP speaker process.
//!
//! Wires the three subsystems together: a TCP listener matching inbound
//! connections to configured [`Peer`]s, one [`PeerSession`] task per peer
//! driving its [`Fsm`](crate::fsm::Fsm), and a central Decision Process loop
//! that reacts to `DecisionSignal`s by re-running Phase 2/3 and pushing the
//! resulting UPDATEs onto each peer's outbound channel.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::config::Config;
use crate::decision::{disseminate_to_peer, min_route_advertisement_interval_elapsed, run_decision_process};
use crate::peer::{Peer, PeerHandle};
use crate::rib::LocRib;
use crate::session::{Control, PeerSession};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors that can occur while running the speaker's listener.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind listener on {0}:{1}: {2}")]
    Bind(std::net::IpAddr, u16, #[source] std::io::Error),
}

struct RunningPeer {
    handle: PeerHandle,
    control_tx: mpsc::UnboundedSender<Control>,
    session: JoinHandle<()>,
}

/// The speaker: one [`Peer`]/[`PeerSession`] per configured neighbor, a
/// shared [`LocRib`], and the central Decision Process loop, which is the
/// only writer of Loc-RIB.
pub struct Speaker {
    local_asn: u16,
    local_bgp_id: Ipv4Addr,
    listen_addr: std::net::IpAddr,
    listen_port: u16,
    peers: HashMap<Ipv4Addr, RunningPeer>,
    loc_rib: Arc<LocRib>,
    decision_rx: mpsc::UnboundedReceiver<()>,
}

impl Speaker {
    /// Build a speaker from a loaded [`Config`], spawning one session task
    /// per configured peer. Sessions start immediately (RFC 4271's
    /// `ManualStart`/`ManualStartWithPassiveTcp`, issued by
    /// [`PeerSession::run`]); none will reach `Established` until
    /// [`Self::run`] is driving the listener loop.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let (decision_tx, decision_rx) = mpsc::unbounded_channel();
        let mut peers = HashMap::new();
        for peer_config in config.peer_configs() {
            let remote_addr = peer_config.remote_addr;
            let handle: PeerHandle = Arc::new(Peer::new(peer_config));
            let (control_tx, session) = PeerSession::spawn(handle.clone(), decision_tx.clone());
            peers.insert(remote_addr, RunningPeer { handle, control_tx, session });
        }
        Self {
            local_asn: config.local_as,
            local_bgp_id: config.local_bgp_id,
            listen_addr: config.listen_addr,
            listen_port: config.listen_port,
            peers,
            loc_rib: Arc::new(LocRib::new()),
            decision_rx,
        }
    }

    #[must_use]
    pub fn loc_rib(&self) -> &Arc<LocRib> {
        &self.loc_rib
    }

    /// Bind the listener and run until every peer session has stopped.
    /// Accepts inbound connections and matches them to a configured peer by
    /// source address; connections from unconfigured peers are simply
    /// dropped (no capability negotiation decides this). Each signal on the
    /// decision channel triggers one Decision Process pass (Phase 2 then
    /// Phase 3) over every destination currently held by any peer's
    /// Adj-RIB-In.
    pub async fn run(mut self) -> Result<(), Error> {
        let listener = TcpListener::bind((self.listen_addr, self.listen_port))
            .await
            .map_err(|e| Error::Bind(self.listen_addr, self.listen_port, e))?;
        log::info!("listening for BGP connections on {}:{}", self.listen_addr, self.listen_port);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => self.handle_incoming(stream, remote.ip()).await,
                        Err(e) => log::warn!("accept failed: {e}"),
                    }
                }
                Some(()) = self.decision_rx.recv() => {
                    self.run_decision_process().await;
                }
            }
        }
    }

    async fn handle_incoming(&self, stream: tokio::net::TcpStream, remote: std::net::IpAddr) {
        let std::net::IpAddr::V4(remote) = remote else {
            log::warn!("rejecting non-IPv4 inbound connection from {remote}");
            return;
        };
        match self.peers.get(&remote) {
            Some(running) => {
                if running.control_tx.send(Control::Incoming(stream)).is_err() {
                    log::warn!("session for {remote} is no longer running; dropping inbound connection");
                }
            }
            None => log::warn!("rejecting inbound connection from unconfigured peer {remote}"),
        }
    }

    /// Run Phase 2 over every peer's Adj-RIB-In, then Phase 3 for every
    /// established peer, respecting each peer's
    /// `MinRouteAdvertisementIntervalTimer`.
    async fn run_decision_process(&self) {
        let handles: Vec<PeerHandle> = self.peers.values().map(|p| p.handle.clone()).collect();
        let changed = run_decision_process(self.local_asn, &handles, &self.loc_rib);
        if changed.is_empty() {
            return;
        }
        for running in self.peers.values() {
            if !running.handle.is_established() {
                continue;
            }
            let updates = disseminate_to_peer(self.local_asn, self.local_bgp_id, &running.handle, &self.loc_rib, &changed);
            if updates.is_empty() {
                continue;
            }
            if !min_route_advertisement_interval_elapsed(&running.handle, std::time::Instant::now()).await {
                continue;
            }
            for update in updates {
                if running.handle.outbound_tx.send(crate::message::Message::Update(update)).is_err() {
                    log::warn!("outbound channel for {} closed", running.handle.config.remote_addr);
                }
            }
        }
    }

    /// Request every peer session to stop (`ManualStop`) and wait for each
    /// to reach `Idle` before returning.
    pub async fn shutdown(self) {
        for running in self.peers.values() {
            let _ = running.control_tx.send(Control::Stop);
        }
        for running in self.peers.into_values() {
            if let Err(e) = running.session.await {
                log::warn!("peer session task panicked during shutdown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_config() -> Config {
        let toml = r#"
            local_as = 65000
            local_bgp_id = "192.0.2.1"
            listen_port = 17900

            [[peer]]
            remote_as = 65001
            remote_addr = "192.0.2.2"
        "#;
        toml::from_str(toml).unwrap()
    }

    #[tokio::test]
    async fn test_speaker_new_spawns_one_session_per_peer() {
        let config = sample_config();
        let speaker = Speaker::new(&config);
        assert_eq!(speaker.peers.len(), 1);
        assert!(speaker.peers.contains_key(&Ipv4Addr::new(192, 0, 2, 2)));
        speaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_decision_process_pass_with_no_changes_is_a_noop() {
        let config = sample_config();
        let speaker = Speaker::new(&config);
        speaker.run_decision_process().await;
        assert!(speaker.loc_rib().is_empty());
        speaker.shutdown().await;
    }
}
