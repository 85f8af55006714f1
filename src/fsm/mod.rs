//! The per-peer BGP finite state machine (RFC 4271 Section 8)
//!
//! The FSM is pure: [`Fsm::handle_event`] takes an [`Event`] and returns the
//! [`Effect`]s the caller (`session`) must carry out -- sending a message,
//! (re)arming a timer, closing the socket. No I/O happens here, so every RFC
//! 4271 state and event is represented explicitly and can be driven without
//! a live socket in tests.

// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod damping;
pub mod timer;

#[cfg(test)]
mod tests;

use crate::message::{CeaseSubcode, NotificationErrorCode, Notification, Open, Update};
use damping::OscillationHistory;
use std::net::Ipv4Addr;
use std::time::Duration;
use timer::{DEFAULT_CONNECT_RETRY_TIME, DEFAULT_DELAY_OPEN_TIME, DEFAULT_LARGE_HOLD_TIME};

/// RFC 4271 Section 8.2.1 session states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl State {
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Established)
    }
}

/// The (error code, error subcode, data) of a NOTIFICATION the transport or
/// message layer wants reported, passed into the FSM as part of an error
/// event so the FSM can decide the resulting transition and emit the
/// `SendNotification` effect itself.
#[derive(Clone, Debug)]
pub struct NotificationInfo {
    pub error_code: NotificationErrorCode,
    pub error_subcode: u8,
}

impl NotificationInfo {
    #[must_use]
    pub fn new(error_code: NotificationErrorCode, error_subcode: u8) -> Self {
        Self { error_code, error_subcode }
    }
}

/// RFC 4271 Section 8.1's 28 FSM events.
#[derive(Debug)]
pub enum Event {
    // Administrative (1-8)
    ManualStart,
    ManualStop,
    AutomaticStart,
    ManualStartWithPassiveTcp,
    AutomaticStartWithPassiveTcp,
    AutomaticStartWithDampPeerOscillations,
    AutomaticStartWithDampPeerOscillationsAndPassiveTcp,
    AutomaticStop,
    // Timer (9-13)
    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    DelayOpenTimerExpires,
    IdleHoldTimerExpires,
    // Transport (14-18)
    TcpConnectionValid,
    TcpCrInvalid,
    TcpCrAcked,
    TcpConnectionConfirmed,
    TcpConnectionFails,
    // Message (19-28)
    BgpOpen(Open),
    BgpOpenWithDelayOpenTimerRunning(Open),
    BgpHeaderErr(NotificationInfo),
    BgpOpenMsgErr(NotificationInfo),
    OpenCollisionDump,
    NotifMsgVerErr,
    NotifMsg(Notification),
    KeepAliveMsg,
    UpdateMsg(Update),
    UpdateMsgErr(NotificationInfo),
}

/// Side effects the FSM asks its caller to carry out. The FSM itself never
/// touches a socket or timer directly.
#[derive(Debug)]
pub enum Effect {
    InitiateTcpConnect,
    InitiateTcpListen,
    CloseConnection,
    SendOpen(Open),
    SendKeepalive,
    SendNotification(Notification),
    ArmConnectRetryTimer,
    StopConnectRetryTimer,
    ArmHoldTimer(Duration),
    StopHoldTimer,
    ArmKeepaliveTimer(Duration),
    StopKeepaliveTimer,
    ArmDelayOpenTimer,
    StopDelayOpenTimer,
    ArmIdleHoldTimer(Duration),
    /// Adj-RIB-In/Out for this peer must be cleared and the decision process
    /// re-run for any destination that lost its only route.
    ReleaseRoutes,
    /// The session just reached Established; the decision process should run
    /// Phase 3 dissemination for this peer.
    SessionEstablished,
}

/// Per-session configuration and mutable FSM attributes (RFC 4271 Section
/// 8.1.1).
#[derive(Debug, Clone)]
pub struct SessionAttributes {
    pub local_asn: u16,
    pub local_bgp_id: Ipv4Addr,
    pub peer_asn: u16,
    pub connect_retry_time: Duration,
    pub configured_hold_time: Duration,
    pub allow_automatic_start: bool,
    pub allow_automatic_stop: bool,
    pub collision_detect_established_state: bool,
    pub damp_peer_oscillations: bool,
    pub delay_open: bool,
    pub delay_open_time: Duration,
    pub passive_tcp_establishment: bool,
    pub send_notification_without_open: bool,
}

impl SessionAttributes {
    #[must_use]
    pub fn new(local_asn: u16, local_bgp_id: Ipv4Addr, peer_asn: u16, configured_hold_time: Duration) -> Self {
        Self {
            local_asn,
            local_bgp_id,
            peer_asn,
            connect_retry_time: DEFAULT_CONNECT_RETRY_TIME,
            configured_hold_time,
            allow_automatic_start: true,
            allow_automatic_stop: false,
            collision_detect_established_state: false,
            damp_peer_oscillations: false,
            delay_open: false,
            delay_open_time: DEFAULT_DELAY_OPEN_TIME,
            passive_tcp_establishment: false,
            send_notification_without_open: false,
        }
    }
}

/// The result of comparing two BGP Identifiers during collision resolution
/// (RFC 4271 Section 6.8).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollisionOutcome {
    KeepThis,
    KeepOther,
}

/// Compare two BGP Identifiers for connection collision resolution: the
/// connection initiated by the speaker with the higher identifier prevails.
#[must_use]
pub fn resolve_collision(this_bgp_id: Ipv4Addr, other_bgp_id: Ipv4Addr) -> CollisionOutcome {
    if u32::from(this_bgp_id) >= u32::from(other_bgp_id) {
        CollisionOutcome::KeepThis
    } else {
        CollisionOutcome::KeepOther
    }
}

/// A single peer's finite state machine.
pub struct Fsm {
    pub state: State,
    pub attrs: SessionAttributes,
    connect_retry_counter: u32,
    delay_open_timer_running: bool,
    oscillation: OscillationHistory,
    /// BGP Identifier learned from the peer's OPEN, used for collision
    /// resolution and logging; `None` before OpenSent completes.
    pub peer_bgp_id: Option<Ipv4Addr>,
}

impl Fsm {
    #[must_use]
    pub fn new(attrs: SessionAttributes) -> Self {
        Self {
            state: State::Idle,
            attrs,
            connect_retry_counter: 0,
            delay_open_timer_running: false,
            oscillation: OscillationHistory::new(),
            peer_bgp_id: None,
        }
    }

    /// Drop back to `Connect` for a new connection replacing the current
    /// one, without touching `connect_retry_counter` or oscillation-damping
    /// history -- used by collision resolution (Section 6.8), where this is
    /// a deliberate handoff rather than a failure.
    pub fn reset_for_new_connection(&mut self) {
        self.state = State::Connect;
        self.peer_bgp_id = None;
        self.delay_open_timer_running = false;
    }

    /// Whether the `HoldTimer` / `KeepaliveTimer` pair is in use; HoldTime=0
    /// disables both (RFC 4271 Section 4.4).
    fn hold_time_active(&self) -> bool {
        self.attrs.configured_hold_time != Duration::ZERO
    }

    fn common_error_exit(&mut self, notification: Option<Notification>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(n) = notification {
            effects.push(Effect::SendNotification(n));
        }
        effects.push(Effect::StopConnectRetryTimer);
        effects.push(Effect::StopHoldTimer);
        effects.push(Effect::StopKeepaliveTimer);
        effects.push(Effect::StopDelayOpenTimer);
        effects.push(Effect::CloseConnection);
        effects.push(Effect::ReleaseRoutes);
        self.connect_retry_counter += 1;
        if self.attrs.damp_peer_oscillations {
            let idle_hold = self.oscillation.record_flap();
            effects.push(Effect::ArmIdleHoldTimer(idle_hold));
        } else {
            effects.push(Effect::ArmConnectRetryTimer);
        }
        self.state = State::Idle;
        self.peer_bgp_id = None;
        self.delay_open_timer_running = false;
        effects
    }

    /// Drive the FSM with one event, returning the effects to carry out.
    pub fn handle_event(&mut self, event: Event) -> Vec<Effect> {
        match self.state {
            State::Idle => self.handle_idle(event),
            State::Connect => self.handle_connect(event),
            State::Active => self.handle_active(event),
            State::OpenSent => self.handle_open_sent(event),
            State::OpenConfirm => self.handle_open_confirm(event),
            State::Established => self.handle_established(event),
        }
    }

    fn handle_idle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ManualStart | Event::AutomaticStart => {
                self.connect_retry_counter = 0;
                self.state = State::Connect;
                vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpConnect]
            }
            Event::ManualStartWithPassiveTcp | Event::AutomaticStartWithPassiveTcp => {
                self.connect_retry_counter = 0;
                self.state = State::Active;
                vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpListen]
            }
            Event::AutomaticStartWithDampPeerOscillations => {
                self.attrs.damp_peer_oscillations = true;
                self.connect_retry_counter = 0;
                self.state = State::Connect;
                vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpConnect]
            }
            Event::AutomaticStartWithDampPeerOscillationsAndPassiveTcp => {
                self.attrs.damp_peer_oscillations = true;
                self.connect_retry_counter = 0;
                self.state = State::Active;
                vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpListen]
            }
            Event::IdleHoldTimerExpires => {
                self.connect_retry_counter = 0;
                if self.attrs.passive_tcp_establishment {
                    self.state = State::Active;
                    vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpListen]
                } else {
                    self.state = State::Connect;
                    vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpConnect]
                }
            }
            // All other events are ignored in Idle per RFC 4271 Section 8.2.2.
            _ => Vec::new(),
        }
    }

    fn handle_connect(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ManualStop => {
                self.connect_retry_counter = 0;
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection]
            }
            Event::ConnectRetryTimerExpires => {
                vec![Effect::ArmConnectRetryTimer, Effect::CloseConnection, Effect::InitiateTcpConnect]
            }
            Event::DelayOpenTimerExpires => {
                self.delay_open_timer_running = false;
                self.state = State::OpenSent;
                vec![
                    Effect::SendOpen(self.make_open()),
                    Effect::ArmHoldTimer(DEFAULT_LARGE_HOLD_TIME),
                ]
            }
            Event::TcpConnectionValid | Event::TcpCrAcked | Event::TcpConnectionConfirmed => {
                if self.attrs.delay_open {
                    self.delay_open_timer_running = true;
                    vec![Effect::ArmDelayOpenTimer]
                } else {
                    self.state = State::OpenSent;
                    vec![
                        Effect::SendOpen(self.make_open()),
                        Effect::ArmHoldTimer(DEFAULT_LARGE_HOLD_TIME),
                    ]
                }
            }
            Event::TcpCrInvalid => Vec::new(),
            Event::TcpConnectionFails => {
                if self.delay_open_timer_running {
                    self.delay_open_timer_running = false;
                    self.state = State::Active;
                    vec![Effect::ArmConnectRetryTimer, Effect::StopDelayOpenTimer]
                } else {
                    self.state = State::Idle;
                    vec![Effect::StopConnectRetryTimer, Effect::CloseConnection, Effect::ReleaseRoutes]
                }
            }
            Event::BgpOpenWithDelayOpenTimerRunning(open) => {
                self.peer_bgp_id = Some(open.bgp_id);
                self.delay_open_timer_running = false;
                self.state = State::OpenConfirm;
                vec![
                    Effect::StopDelayOpenTimer,
                    Effect::SendOpen(self.make_open()),
                    Effect::SendKeepalive,
                    Effect::ArmHoldTimer(DEFAULT_LARGE_HOLD_TIME),
                    Effect::ArmKeepaliveTimer(self.attrs.configured_hold_time / 3),
                ]
            }
            Event::NotifMsgVerErr => self.common_error_exit(None),
            _ => self.common_error_exit(None),
        }
    }

    fn handle_active(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ManualStop => {
                self.connect_retry_counter = 0;
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection]
            }
            Event::ConnectRetryTimerExpires => {
                self.state = State::Connect;
                vec![Effect::ArmConnectRetryTimer, Effect::InitiateTcpConnect]
            }
            Event::DelayOpenTimerExpires => {
                self.delay_open_timer_running = false;
                self.state = State::OpenSent;
                vec![
                    Effect::SendOpen(self.make_open()),
                    Effect::ArmHoldTimer(DEFAULT_LARGE_HOLD_TIME),
                ]
            }
            Event::TcpConnectionValid | Event::TcpCrAcked | Event::TcpConnectionConfirmed => {
                if self.attrs.delay_open {
                    self.delay_open_timer_running = true;
                    vec![Effect::ArmDelayOpenTimer]
                } else {
                    self.state = State::OpenSent;
                    vec![
                        Effect::SendOpen(self.make_open()),
                        Effect::ArmHoldTimer(DEFAULT_LARGE_HOLD_TIME),
                    ]
                }
            }
            Event::TcpConnectionFails => {
                self.connect_retry_counter += 1;
                self.state = State::Idle;
                let mut effects = vec![Effect::ArmConnectRetryTimer, Effect::ReleaseRoutes];
                if self.attrs.damp_peer_oscillations {
                    let idle_hold = self.oscillation.record_flap();
                    effects.push(Effect::ArmIdleHoldTimer(idle_hold));
                }
                effects
            }
            Event::BgpOpenWithDelayOpenTimerRunning(open) => {
                self.peer_bgp_id = Some(open.bgp_id);
                self.delay_open_timer_running = false;
                self.state = State::OpenConfirm;
                vec![
                    Effect::StopDelayOpenTimer,
                    Effect::SendOpen(self.make_open()),
                    Effect::SendKeepalive,
                    Effect::ArmHoldTimer(DEFAULT_LARGE_HOLD_TIME),
                    Effect::ArmKeepaliveTimer(self.attrs.configured_hold_time / 3),
                ]
            }
            Event::NotifMsgVerErr => {
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection]
            }
            _ => self.common_error_exit(None),
        }
    }

    fn handle_open_sent(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ManualStop => {
                self.state = State::Idle;
                vec![
                    Effect::SendNotification(Notification::new(
                        NotificationErrorCode::Cease,
                        CeaseSubcode::AdministrativeShutdown as u8,
                        bytes::Bytes::new(),
                    )),
                    Effect::StopConnectRetryTimer,
                    Effect::CloseConnection,
                ]
            }
            Event::HoldTimerExpires => self.common_error_exit(Some(Notification::new(
                NotificationErrorCode::HoldTimerExpired,
                0,
                bytes::Bytes::new(),
            ))),
            Event::TcpConnectionFails => {
                self.state = State::Active;
                vec![Effect::ArmConnectRetryTimer]
            }
            Event::BgpOpen(open) => {
                self.peer_bgp_id = Some(open.bgp_id);
                let negotiated_hold = self.attrs.configured_hold_time.min(Duration::from_secs(u64::from(open.hold_time)));
                self.attrs.configured_hold_time = negotiated_hold;
                self.state = State::OpenConfirm;
                let mut effects = vec![Effect::SendKeepalive];
                if self.hold_time_active() {
                    effects.push(Effect::ArmHoldTimer(negotiated_hold));
                    effects.push(Effect::ArmKeepaliveTimer(negotiated_hold / 3));
                } else {
                    effects.push(Effect::StopHoldTimer);
                    effects.push(Effect::StopKeepaliveTimer);
                }
                effects
            }
            Event::BgpHeaderErr(info) | Event::BgpOpenMsgErr(info) => {
                self.common_error_exit(Some(Notification::new(info.error_code, info.error_subcode, bytes::Bytes::new())))
            }
            Event::NotifMsgVerErr => {
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection]
            }
            // KEEPALIVE/UPDATE/NOTIFICATION before a BGP Identifier has even
            // been exchanged are out of sequence (RFC 4271 Section 8.2.1.2,
            // Events 9/26/27/28 in OpenSent): report FSM Error rather than
            // silently dropping the connection.
            Event::KeepAliveMsg | Event::UpdateMsg(_) | Event::UpdateMsgErr(_) | Event::NotifMsg(_) => {
                self.common_error_exit(Some(Notification::new(NotificationErrorCode::FiniteStateMachineError, 0, bytes::Bytes::new())))
            }
            _ => self.common_error_exit(None),
        }
    }

    fn handle_open_confirm(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ManualStop => {
                self.state = State::Idle;
                vec![
                    Effect::SendNotification(Notification::new(
                        NotificationErrorCode::Cease,
                        CeaseSubcode::AdministrativeShutdown as u8,
                        bytes::Bytes::new(),
                    )),
                    Effect::StopConnectRetryTimer,
                    Effect::CloseConnection,
                ]
            }
            Event::HoldTimerExpires => self.common_error_exit(Some(Notification::new(
                NotificationErrorCode::HoldTimerExpired,
                0,
                bytes::Bytes::new(),
            ))),
            Event::KeepaliveTimerExpires => {
                vec![
                    Effect::SendKeepalive,
                    Effect::ArmKeepaliveTimer(self.attrs.configured_hold_time / 3),
                ]
            }
            Event::TcpConnectionFails | Event::NotifMsg(_) => {
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection, Effect::ReleaseRoutes]
            }
            Event::OpenCollisionDump => self.common_error_exit(Some(Notification::new(
                NotificationErrorCode::Cease,
                CeaseSubcode::ConnectionCollisionResolution as u8,
                bytes::Bytes::new(),
            ))),
            Event::KeepAliveMsg => {
                self.state = State::Established;
                self.oscillation.record_stable();
                vec![
                    Effect::ArmHoldTimer(self.attrs.configured_hold_time),
                    Effect::SessionEstablished,
                ]
            }
            Event::NotifMsgVerErr => {
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection]
            }
            // UPDATE arriving before KEEPALIVE confirms the session is out
            // of sequence (RFC 4271 Section 8.2.1.2, Event 27 in OpenConfirm).
            Event::UpdateMsg(_) | Event::UpdateMsgErr(_) => {
                self.common_error_exit(Some(Notification::new(NotificationErrorCode::FiniteStateMachineError, 0, bytes::Bytes::new())))
            }
            _ => self.common_error_exit(None),
        }
    }

    fn handle_established(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ManualStop => {
                self.state = State::Idle;
                vec![
                    Effect::SendNotification(Notification::new(
                        NotificationErrorCode::Cease,
                        CeaseSubcode::AdministrativeShutdown as u8,
                        bytes::Bytes::new(),
                    )),
                    Effect::StopConnectRetryTimer,
                    Effect::CloseConnection,
                    Effect::ReleaseRoutes,
                ]
            }
            Event::HoldTimerExpires => self.common_error_exit(Some(Notification::new(
                NotificationErrorCode::HoldTimerExpired,
                0,
                bytes::Bytes::new(),
            ))),
            Event::KeepaliveTimerExpires => {
                vec![
                    Effect::SendKeepalive,
                    Effect::ArmKeepaliveTimer(self.attrs.configured_hold_time / 3),
                ]
            }
            Event::TcpConnectionFails | Event::NotifMsg(_) => {
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection, Effect::ReleaseRoutes]
            }
            Event::OpenCollisionDump => self.common_error_exit(Some(Notification::new(
                NotificationErrorCode::Cease,
                CeaseSubcode::ConnectionCollisionResolution as u8,
                bytes::Bytes::new(),
            ))),
            Event::KeepAliveMsg | Event::UpdateMsg(_) => {
                if self.hold_time_active() {
                    vec![Effect::ArmHoldTimer(self.attrs.configured_hold_time)]
                } else {
                    Vec::new()
                }
            }
            Event::UpdateMsgErr(info) | Event::BgpHeaderErr(info) => self.common_error_exit(Some(Notification::new(
                info.error_code,
                info.error_subcode,
                bytes::Bytes::new(),
            ))),
            Event::NotifMsgVerErr => {
                self.state = State::Idle;
                vec![Effect::StopConnectRetryTimer, Effect::CloseConnection, Effect::ReleaseRoutes]
            }
            _ => self.common_error_exit(None),
        }
    }

    fn make_open(&self) -> Open {
        Open::new(
            self.attrs.local_asn,
            u16::try_from(self.attrs.configured_hold_time.as_secs()).unwrap_or(u16::MAX),
            self.attrs.local_bgp_id,
        )
    }
}
