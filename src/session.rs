//! The per-peer session task (RFC 4271 Section 8)
//!
//! Drives one peer's [`Fsm`] against a (possibly absent) TCP connection,
//! turning socket I/O and timer expiry into [`Event`]s and the [`Effect`]s
//! the FSM returns into socket writes, timer (re)arms, and RIB updates. One
//! task per peer, running `FramedRead`/`FramedWrite` over a split
//! `TcpStream` and driving the explicit [`Fsm`] so every RFC 4271 state,
//! timer, and error path is represented, not just the happy path.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::fsm::timer::Timer;
use crate::fsm::{self, CollisionOutcome, Effect, Event, Fsm, NotificationInfo, SessionAttributes};
use crate::message::path::{Data, Type};
use crate::message::{self, CeaseSubcode, Message, NotificationErrorCode, Notification, Open, Update};
use crate::peer::PeerHandle;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::{tcp, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

/// The well-known BGP port (RFC 4271 Section 8, `TcpConnectionConfirmed`).
const BGP_PORT: u16 = 179;

/// How long to wait for a colliding inbound connection's OPEN before giving
/// up on reading its BGP Identifier and rejecting it outright.
const COLLISION_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A signal that some peer's Adj-RIB-In changed, or that it dropped out of
/// Established; the central Decision Process loop in `speaker` coalesces
/// these rather than carrying data, since it always re-derives the affected
/// destinations itself (RFC 4271 Section 9.1).
pub type DecisionSignal = ();

/// Out-of-band input a running [`PeerSession`] accepts from the rest of the
/// process: an inbound TCP connection the listener matched to this peer, or
/// a request to shut the session down.
pub enum Control {
    Incoming(TcpStream),
    Stop,
}

struct Connection {
    rx: FramedRead<tcp::OwnedReadHalf, message::Codec>,
    tx: FramedWrite<tcp::OwnedWriteHalf, message::Codec>,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        Self {
            rx: FramedRead::new(rx, message::Codec),
            tx: FramedWrite::new(tx, message::Codec),
        }
    }
}

/// The five RFC 4271 Section 8 per-peer timers, owned by the session task
/// rather than the pure [`Fsm`] -- the FSM only ever needs to tell its
/// caller what to arm.
#[derive(Default)]
struct Timers {
    connect_retry: Timer,
    hold: Timer,
    keepalive: Timer,
    delay_open: Timer,
    idle_hold: Timer,
}

type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// Drives one peer's [`Fsm`] for the life of the process.
pub struct PeerSession {
    peer: PeerHandle,
    fsm: Fsm,
    control_rx: mpsc::UnboundedReceiver<Control>,
    decision_tx: mpsc::UnboundedSender<DecisionSignal>,
    conn: Option<Connection>,
    pending_connect: Option<ConnectFuture>,
    timers: Timers,
}

impl PeerSession {
    #[must_use]
    pub fn new(peer: PeerHandle, control_rx: mpsc::UnboundedReceiver<Control>, decision_tx: mpsc::UnboundedSender<DecisionSignal>) -> Self {
        let mut attrs = SessionAttributes::new(
            peer.config.local_asn,
            peer.config.local_bgp_id,
            peer.config.remote_asn,
            peer.config.hold_time,
        );
        attrs.passive_tcp_establishment = peer.config.passive;
        attrs.delay_open = peer.config.delay_open;
        attrs.damp_peer_oscillations = peer.config.damp_peer_oscillations;
        Self {
            peer,
            fsm: Fsm::new(attrs),
            control_rx,
            decision_tx,
            conn: None,
            pending_connect: None,
            timers: Timers::default(),
        }
    }

    /// Spawn this session as its own task, returning a handle to send it
    /// [`Control`] messages and a [`tokio::task::JoinHandle`] that resolves
    /// once the session's FSM has returned to `Idle` after a `Control::Stop`,
    /// so a caller driving process shutdown can wait for it.
    #[must_use]
    pub fn spawn(
        peer: PeerHandle,
        decision_tx: mpsc::UnboundedSender<DecisionSignal>,
    ) -> (mpsc::UnboundedSender<Control>, tokio::task::JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Self::new(peer, control_rx, decision_tx);
        let handle = tokio::spawn(session.run());
        (control_tx, handle)
    }

    /// Run the session to completion: starts the FSM (`ManualStart` or
    /// `ManualStartWithPassiveTcp` depending on configuration), then services
    /// socket I/O, timers, and [`Control`] messages until a `Control::Stop`
    /// (or a closed control channel) drives the FSM back to `Idle`.
    pub async fn run(mut self) {
        let mut outbound_rx = self.peer.take_outbound_rx().await;
        let start = if self.peer.config.passive {
            Event::ManualStartWithPassiveTcp
        } else {
            Event::ManualStart
        };
        let effects = self.fsm.handle_event(start);
        self.apply_effects(effects).await;

        let mut stopping = false;
        loop {
            tokio::select! {
                control = self.control_rx.recv() => {
                    match control {
                        Some(Control::Incoming(stream)) => self.handle_incoming(stream).await,
                        Some(Control::Stop) | None => {
                            stopping = true;
                            let effects = self.fsm.handle_event(Event::ManualStop);
                            self.apply_effects(effects).await;
                        }
                    }
                }
                read = read_next(self.conn.as_mut().expect("guarded by is_some")), if self.conn.is_some() => {
                    self.handle_read(read).await;
                }
                Some(msg) = outbound_rx.recv(), if self.conn.is_some() && self.fsm.state.is_established() => {
                    self.send(msg).await;
                }
                connected = poll_pending_connect(self.pending_connect.as_mut().expect("guarded by is_some")), if self.pending_connect.is_some() => {
                    self.pending_connect = None;
                    let event = match connected {
                        Ok(stream) => {
                            self.conn = Some(Connection::new(stream));
                            Event::TcpConnectionConfirmed
                        }
                        Err(e) => {
                            log::info!("connection attempt to {} failed: {e}", self.peer.config.remote_addr);
                            Event::TcpConnectionFails
                        }
                    };
                    let effects = self.fsm.handle_event(event);
                    self.apply_effects(effects).await;
                }
                () = self.timers.connect_retry.wait(), if self.timers.connect_retry.is_armed() => {
                    let effects = self.fsm.handle_event(Event::ConnectRetryTimerExpires);
                    self.apply_effects(effects).await;
                }
                () = self.timers.hold.wait(), if self.timers.hold.is_armed() => {
                    let effects = self.fsm.handle_event(Event::HoldTimerExpires);
                    self.apply_effects(effects).await;
                }
                () = self.timers.keepalive.wait(), if self.timers.keepalive.is_armed() => {
                    let effects = self.fsm.handle_event(Event::KeepaliveTimerExpires);
                    self.apply_effects(effects).await;
                }
                () = self.timers.delay_open.wait(), if self.timers.delay_open.is_armed() => {
                    let effects = self.fsm.handle_event(Event::DelayOpenTimerExpires);
                    self.apply_effects(effects).await;
                }
                () = self.timers.idle_hold.wait(), if self.timers.idle_hold.is_armed() => {
                    let effects = self.fsm.handle_event(Event::IdleHoldTimerExpires);
                    self.apply_effects(effects).await;
                }
            }

            if stopping && self.fsm.state == fsm::State::Idle {
                log::info!("session with {} stopped", self.peer.config.remote_addr);
                break;
            }
        }
    }

    /// An inbound connection the listener matched to this peer. If an
    /// existing connection already reached OpenConfirm or Established, this
    /// is a genuine collision (RFC 4271 Section 6.8): resolved there, not by
    /// which connection happened to arrive first.
    async fn handle_incoming(&mut self, stream: TcpStream) {
        if self.conn.is_some() && matches!(self.fsm.state, fsm::State::OpenConfirm | fsm::State::Established) {
            self.resolve_incoming_collision(stream).await;
            return;
        }
        self.pending_connect = None;
        self.conn = Some(Connection::new(stream));
        let effects = self.fsm.handle_event(Event::TcpConnectionConfirmed);
        self.apply_effects(effects).await;
    }

    /// RFC 4271 Section 6.8 collision resolution: read the colliding
    /// connection's OPEN to learn its BGP Identifier and compare it against
    /// this speaker's own, since only that comparison -- not which
    /// connection arrived first -- decides the survivor. The connection
    /// belonging to the speaker with the higher-valued Identifier prevails;
    /// the other is closed with NOTIFICATION Cease/Connection Collision
    /// Resolution.
    async fn resolve_incoming_collision(&mut self, stream: TcpStream) {
        let mut probe = FramedRead::new(stream, message::Codec);
        let first = tokio::time::timeout(COLLISION_OPEN_TIMEOUT, probe.next()).await;
        let Ok(Some(Ok(Message::Open(open)))) = first else {
            log::warn!(
                "rejecting colliding inbound connection from {}: no valid OPEN within {:?}",
                self.peer.config.remote_addr,
                COLLISION_OPEN_TIMEOUT
            );
            return;
        };

        match fsm::resolve_collision(self.peer.config.local_bgp_id, open.bgp_id) {
            CollisionOutcome::KeepThis => {
                log::warn!(
                    "collision resolution with {}: keeping the existing connection (local Identifier {} >= {})",
                    self.peer.config.remote_addr,
                    self.peer.config.local_bgp_id,
                    open.bgp_id
                );
                let mut reject = FramedWrite::new(probe.into_inner(), message::Codec);
                let _ = reject
                    .send(Message::Notification(Notification::new(
                        NotificationErrorCode::Cease,
                        CeaseSubcode::ConnectionCollisionResolution as u8,
                        Bytes::new(),
                    )))
                    .await;
            }
            CollisionOutcome::KeepOther => {
                log::warn!(
                    "collision resolution with {}: new inbound connection wins (peer Identifier {} > local {})",
                    self.peer.config.remote_addr,
                    open.bgp_id,
                    self.peer.config.local_bgp_id
                );
                self.send(Message::Notification(Notification::new(
                    NotificationErrorCode::Cease,
                    CeaseSubcode::ConnectionCollisionResolution as u8,
                    Bytes::new(),
                )))
                .await;
                self.apply_effect(Effect::ReleaseRoutes).await;
                self.timers = Timers::default();
                self.pending_connect = None;
                self.fsm.reset_for_new_connection();
                self.conn = Some(Connection::new(probe.into_inner()));
                let effects = self.fsm.handle_event(Event::TcpConnectionConfirmed);
                self.apply_effects(effects).await;
                let effects = self.fsm.handle_event(Event::BgpOpen(open));
                self.apply_effects(effects).await;
            }
        }
    }

    async fn handle_read(&mut self, read: Option<Result<Message, message::Error>>) {
        match read {
            Some(Ok(msg)) => self.handle_message(msg).await,
            Some(Err(err)) => {
                log::warn!("decode error from {}: {err}", self.peer.config.remote_addr);
                let effects = self.fsm.handle_event(decode_error_event(&err));
                self.apply_effects(effects).await;
            }
            None => {
                log::info!("connection to {} closed", self.peer.config.remote_addr);
                let effects = self.fsm.handle_event(Event::TcpConnectionFails);
                self.apply_effects(effects).await;
            }
        }
    }

    async fn handle_message(&mut self, msg: Message) {
        let event = match msg {
            Message::Open(open) => match validate_open(&open, self.peer.config.remote_asn) {
                Ok(()) if self.timers.delay_open.is_armed() => Event::BgpOpenWithDelayOpenTimerRunning(open),
                Ok(()) => Event::BgpOpen(open),
                Err((code, subcode)) => Event::BgpOpenMsgErr(NotificationInfo::new(code, subcode)),
            },
            Message::Keepalive => Event::KeepAliveMsg,
            Message::Update(update) => match validate_update(&update, &self.peer) {
                Ok(()) => {
                    self.apply_update_to_rib(&update);
                    let _ = self.decision_tx.send(());
                    Event::UpdateMsg(update)
                }
                Err((code, subcode)) => Event::UpdateMsgErr(NotificationInfo::new(code, subcode)),
            },
            Message::Notification(n) => {
                log::warn!("peer {} sent NOTIFICATION {:?}/{}", self.peer.config.remote_addr, n.error_code, n.error_subcode);
                Event::NotifMsg(n)
            }
        };
        let effects = self.fsm.handle_event(event);
        self.apply_effects(effects).await;
    }

    fn apply_update_to_rib(&self, update: &Update) {
        for withdrawn in update.withdrawn_routes.iter() {
            self.peer.adj_rib_in.remove(withdrawn.to_ipv4_net());
        }
        if !update.nlri.is_empty() {
            for route in update.nlri.iter() {
                self.peer.adj_rib_in.insert(route.to_ipv4_net(), update.path_attributes.clone());
            }
        }
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply_effect(effect).await;
        }
    }

    async fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::InitiateTcpConnect => {
                let addr = (self.peer.config.remote_addr, BGP_PORT);
                self.pending_connect = Some(Box::pin(TcpStream::connect(addr)));
            }
            // Passive establishment has no local action: the speaker's
            // listener delivers a matching inbound connection as
            // `Control::Incoming` once the peer dials in.
            Effect::InitiateTcpListen => {}
            Effect::CloseConnection => {
                self.conn = None;
                self.pending_connect = None;
            }
            Effect::SendOpen(open) => self.send(Message::Open(open)).await,
            Effect::SendKeepalive => self.send(Message::Keepalive).await,
            Effect::SendNotification(notification) => {
                log::warn!(
                    "sending NOTIFICATION to {}: {:?}/{}",
                    self.peer.config.remote_addr,
                    notification.error_code,
                    notification.error_subcode
                );
                self.send(Message::Notification(notification)).await;
            }
            Effect::ArmConnectRetryTimer => self.timers.connect_retry.arm(self.fsm.attrs.connect_retry_time),
            Effect::StopConnectRetryTimer => self.timers.connect_retry.cancel(),
            Effect::ArmHoldTimer(duration) => self.timers.hold.arm_exact(duration),
            Effect::StopHoldTimer => self.timers.hold.cancel(),
            Effect::ArmKeepaliveTimer(duration) => self.timers.keepalive.arm_exact(duration),
            Effect::StopKeepaliveTimer => self.timers.keepalive.cancel(),
            Effect::ArmDelayOpenTimer => self.timers.delay_open.arm(self.fsm.attrs.delay_open_time),
            Effect::StopDelayOpenTimer => self.timers.delay_open.cancel(),
            Effect::ArmIdleHoldTimer(duration) => self.timers.idle_hold.arm(duration),
            Effect::ReleaseRoutes => {
                self.peer.adj_rib_in.clear();
                self.peer.set_established(false);
                self.peer.clear_peer_bgp_id();
                let _ = self.decision_tx.send(());
            }
            Effect::SessionEstablished => {
                if let Some(id) = self.fsm.peer_bgp_id {
                    self.peer.set_peer_bgp_id(id);
                }
                self.peer.set_established(true);
                let _ = self.decision_tx.send(());
            }
        }
    }

    async fn send(&mut self, msg: Message) {
        let Some(conn) = &mut self.conn else { return };
        if let Err(e) = conn.tx.send(msg).await {
            log::warn!("failed to write to {}: {e}", self.peer.config.remote_addr);
            self.conn = None;
        }
    }
}

async fn read_next(conn: &mut Connection) -> Option<Result<Message, message::Error>> {
    conn.rx.next().await
}

async fn poll_pending_connect(pending: &mut ConnectFuture) -> std::io::Result<TcpStream> {
    pending.as_mut().await
}

/// Map a codec decode error to the FSM event carrying its NOTIFICATION
/// error code/subcode (RFC 4271 Section 6).
fn decode_error_event(err: &message::Error) -> Event {
    let (code, subcode) = err.to_notification();
    let info = NotificationInfo::new(code, subcode);
    match code {
        NotificationErrorCode::OpenMessageError => Event::BgpOpenMsgErr(info),
        NotificationErrorCode::UpdateMessageError => Event::UpdateMsgErr(info),
        _ => Event::BgpHeaderErr(info),
    }
}

/// Validate fields of a received OPEN this speaker's codec cannot check on
/// its own because they depend on which peer sent it (RFC 4271 Section 4.2,
/// 6.2): the version, the peer's AS against what was configured, the BGP
/// Identifier, and the Hold Time.
fn validate_open(open: &Open, expected_asn: u16) -> Result<(), (NotificationErrorCode, u8)> {
    use message::OpenMessageErrorSubcode as Subcode;

    if open.version != message::BGP_VERSION {
        return Err((NotificationErrorCode::OpenMessageError, Subcode::UnsupportedVersionNumber as u8));
    }
    if open.asn != expected_asn {
        return Err((NotificationErrorCode::OpenMessageError, Subcode::BadPeerAs as u8));
    }
    if open.bgp_id.is_unspecified() || open.bgp_id.is_multicast() || open.bgp_id.is_broadcast() {
        return Err((NotificationErrorCode::OpenMessageError, Subcode::BadBgpIdentifier as u8));
    }
    if !message::is_valid_hold_time(open.hold_time) {
        return Err((NotificationErrorCode::OpenMessageError, Subcode::UnacceptableHoldTime as u8));
    }
    Ok(())
}

/// Validate fields of a received UPDATE that depend on which peer sent it
/// (RFC 4271 Section 6.3): NEXT_HOP must not be 0.0.0.0, a multicast
/// address, or the peer's own address, and an internal peer must carry
/// LOCAL_PREF. Neither check applies to a withdraw-only UPDATE.
fn validate_update(update: &Update, peer: &PeerHandle) -> Result<(), (NotificationErrorCode, u8)> {
    use message::UpdateMessageErrorSubcode as Subcode;

    if update.nlri.is_empty() {
        return Ok(());
    }
    if let Some(Data::NextHop(next_hop)) = update.path_attributes.get(Type::NextHop) {
        if next_hop.is_unspecified() || next_hop.is_multicast() || *next_hop == peer.config.remote_addr {
            return Err((NotificationErrorCode::UpdateMessageError, Subcode::InvalidNextHopAttribute as u8));
        }
    }
    if peer.config.is_ibgp() && update.path_attributes.get(Type::LocalPref).is_none() {
        return Err((NotificationErrorCode::UpdateMessageError, Subcode::MissingWellKnownAttribute as u8));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::capability::OptionalParameters;
    use crate::message::path::{AsPath, Flags, Origin, PathAttributes, Value};
    use crate::message::route::{Ipv4Net, Routes};
    use crate::peer::{Peer, PeerConfig, PeerPolicy};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    fn sample_peer(remote_asn: u16, local_asn: u16) -> PeerHandle {
        Arc::new(Peer::new(PeerConfig {
            remote_asn,
            remote_addr: Ipv4Addr::new(192, 0, 2, 1),
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

    fn open(asn: u16, hold_time: u16, bgp_id: Ipv4Addr) -> Open {
        Open {
            version: message::BGP_VERSION,
            asn,
            hold_time,
            bgp_id,
            opt_params: OptionalParameters::default(),
        }
    }

    #[test]
    fn test_validate_open_rejects_unexpected_asn() {
        let o = open(65099, 90, Ipv4Addr::new(192, 0, 2, 1));
        let err = validate_open(&o, 65001).unwrap_err();
        assert_eq!(err.0, NotificationErrorCode::OpenMessageError);
        assert_eq!(err.1, message::OpenMessageErrorSubcode::BadPeerAs as u8);
    }

    #[test]
    fn test_validate_open_rejects_bad_hold_time() {
        let o = open(65001, 2, Ipv4Addr::new(192, 0, 2, 1));
        let err = validate_open(&o, 65001).unwrap_err();
        assert_eq!(err.1, message::OpenMessageErrorSubcode::UnacceptableHoldTime as u8);
    }

    #[test]
    fn test_validate_open_rejects_multicast_bgp_id() {
        let o = open(65001, 90, Ipv4Addr::new(224, 0, 0, 1));
        let err = validate_open(&o, 65001).unwrap_err();
        assert_eq!(err.1, message::OpenMessageErrorSubcode::BadBgpIdentifier as u8);
    }

    #[test]
    fn test_validate_open_accepts_well_formed_open() {
        let o = open(65001, 90, Ipv4Addr::new(192, 0, 2, 1));
        assert!(validate_open(&o, 65001).is_ok());
    }

    fn update_with_next_hop(next_hop: Ipv4Addr, with_local_pref: bool) -> Update {
        let mut attrs = vec![
            Value { flags: Flags::WELL_KNOWN, data: Data::Origin(Origin::Igp) },
            Value { flags: Flags::WELL_KNOWN, data: Data::AsPath(AsPath::default()) },
            Value { flags: Flags::WELL_KNOWN, data: Data::NextHop(next_hop) },
        ];
        if with_local_pref {
            attrs.push(Value { flags: Flags::WELL_KNOWN, data: Data::LocalPref(100) });
        }
        Update {
            withdrawn_routes: Routes::default(),
            path_attributes: PathAttributes(attrs),
            nlri: vec![Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8)].into(),
        }
    }

    #[test]
    fn test_validate_update_rejects_next_hop_equal_to_peer_address() {
        let peer = sample_peer(65001, 65000);
        let update = update_with_next_hop(Ipv4Addr::new(192, 0, 2, 1), false);
        let err = validate_update(&update, &peer).unwrap_err();
        assert_eq!(err.1, message::UpdateMessageErrorSubcode::InvalidNextHopAttribute as u8);
    }

    #[test]
    fn test_validate_update_rejects_unspecified_next_hop() {
        let peer = sample_peer(65001, 65000);
        let update = update_with_next_hop(Ipv4Addr::UNSPECIFIED, false);
        let err = validate_update(&update, &peer).unwrap_err();
        assert_eq!(err.1, message::UpdateMessageErrorSubcode::InvalidNextHopAttribute as u8);
    }

    #[test]
    fn test_validate_update_requires_local_pref_for_ibgp() {
        let peer = sample_peer(65000, 65000);
        let update = update_with_next_hop(Ipv4Addr::new(192, 0, 2, 9), false);
        let err = validate_update(&update, &peer).unwrap_err();
        assert_eq!(err.1, message::UpdateMessageErrorSubcode::MissingWellKnownAttribute as u8);
    }

    #[test]
    fn test_validate_update_accepts_well_formed_ibgp_update() {
        let peer = sample_peer(65000, 65000);
        let update = update_with_next_hop(Ipv4Addr::new(192, 0, 2, 9), true);
        assert!(validate_update(&update, &peer).is_ok());
    }

    #[test]
    fn test_validate_update_skips_checks_for_withdraw_only() {
        let peer = sample_peer(65001, 65000);
        let update = Update {
            withdrawn_routes: vec![Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8)].into(),
            path_attributes: PathAttributes::default(),
            nlri: Routes::default(),
        };
        assert!(validate_update(&update, &peer).is_ok());
    }

    #[tokio::test]
    async fn test_session_start_active_arms_connect_retry_and_connects() {
        let peer = sample_peer(65001, 65000);
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let (decision_tx, mut decision_rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(peer, control_rx, decision_tx);
        let effects = session.fsm.handle_event(Event::ManualStart);
        session.apply_effects(effects).await;
        assert!(session.timers.connect_retry.is_armed());
        assert!(session.pending_connect.is_some());
        assert!(decision_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_release_routes_clears_adj_rib_in_and_signals_decision() {
        let peer = sample_peer(65001, 65000);
        peer.adj_rib_in.insert(
            Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8),
            PathAttributes(vec![Value { flags: Flags::WELL_KNOWN, data: Data::Origin(Origin::Igp) }]),
        );
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let (decision_tx, mut decision_rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(peer.clone(), control_rx, decision_tx);
        session.apply_effect(Effect::ReleaseRoutes).await;
        assert!(peer.adj_rib_in.is_empty());
        assert!(decision_rx.try_recv().is_ok());
        assert!(peer.peer_bgp_id().is_none());
    }

    fn open_with_id(bgp_id: Ipv4Addr) -> Open {
        Open {
            version: message::BGP_VERSION,
            asn: 65001,
            hold_time: 90,
            bgp_id,
            opt_params: OptionalParameters::default(),
        }
    }

    /// Builds a connected loopback `TcpStream` pair: the side handed to the
    /// session (or to the code under test) and the side used to drive the
    /// other end from the test.
    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = TcpStream::connect(addr).await.unwrap();
        let (theirs, _) = listener.accept().await.unwrap();
        (ours, theirs)
    }

    #[tokio::test]
    async fn test_collision_resolution_accepts_higher_identifier_inbound() {
        // peer.config.local_bgp_id defaults to 192.0.2.254 (see sample_peer).
        let peer = sample_peer(65001, 65000);
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let (decision_tx, mut decision_rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(peer, control_rx, decision_tx);

        let (existing_ours, _existing_theirs) = loopback_pair().await;
        session.conn = Some(Connection::new(existing_ours));
        session.fsm.state = fsm::State::OpenConfirm;
        session.fsm.peer_bgp_id = Some(Ipv4Addr::new(192, 0, 2, 1));

        let (colliding_ours, colliding_theirs) = loopback_pair().await;
        let higher_bgp_id = Ipv4Addr::new(255, 255, 255, 1);
        let sender = tokio::spawn(async move {
            let mut tx = FramedWrite::new(colliding_theirs, message::Codec);
            tx.send(Message::Open(open_with_id(higher_bgp_id))).await.unwrap();
        });

        session.handle_incoming(colliding_ours).await;
        sender.await.unwrap();

        // The higher-Identifier inbound connection won: the FSM advanced
        // past the handoff back to OpenConfirm with its BGP Identifier, and
        // the losing connection's routes were released.
        assert_eq!(session.fsm.state, fsm::State::OpenConfirm);
        assert_eq!(session.fsm.peer_bgp_id, Some(higher_bgp_id));
        assert!(decision_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_collision_resolution_rejects_lower_identifier_inbound() {
        let peer = sample_peer(65001, 65000);
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let (decision_tx, _decision_rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(peer, control_rx, decision_tx);

        let (existing_ours, _existing_theirs) = loopback_pair().await;
        session.conn = Some(Connection::new(existing_ours));
        session.fsm.state = fsm::State::Established;
        let kept_bgp_id = Ipv4Addr::new(192, 0, 2, 1);
        session.fsm.peer_bgp_id = Some(kept_bgp_id);

        let (colliding_ours, colliding_theirs) = loopback_pair().await;
        let lower_bgp_id = Ipv4Addr::new(1, 0, 0, 1);
        let (their_read, their_write) = colliding_theirs.into_split();
        let mut their_tx = FramedWrite::new(their_write, message::Codec);
        let mut their_rx = FramedRead::new(their_read, message::Codec);

        let sender = tokio::spawn(async move {
            session.handle_incoming(colliding_ours).await;
            session
        });

        // Write the colliding OPEN from the test's side of the new
        // connection, then read back the NOTIFICATION the session sends
        // once it decides the existing (higher-Identifier) connection wins.
        their_tx.send(Message::Open(open_with_id(lower_bgp_id))).await.unwrap();
        let reply = their_rx.next().await.unwrap().unwrap();
        let session = sender.await.unwrap();

        assert!(matches!(
            reply,
            Message::Notification(n) if n.error_code == NotificationErrorCode::Cease
                && n.error_subcode == CeaseSubcode::ConnectionCollisionResolution as u8
        ));
        // The existing connection was left untouched.
        assert_eq!(session.fsm.state, fsm::State::Established);
        assert_eq!(session.fsm.peer_bgp_id, Some(kept_bgp_id));
    }
}
