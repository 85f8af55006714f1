use super::*;
use crate::message::Open;
use std::net::Ipv4Addr;
use std::time::Duration;

fn test_fsm() -> Fsm {
    Fsm::new(SessionAttributes::new(
        65000,
        Ipv4Addr::new(10, 0, 0, 1),
        65001,
        Duration::from_secs(90),
    ))
}

#[test]
fn test_starts_idle() {
    let fsm = test_fsm();
    assert_eq!(fsm.state, State::Idle);
}

#[test]
fn test_manual_start_moves_to_connect() {
    let mut fsm = test_fsm();
    let effects = fsm.handle_event(Event::ManualStart);
    assert_eq!(fsm.state, State::Connect);
    assert!(matches!(effects[0], Effect::ArmConnectRetryTimer));
}

#[test]
fn test_passive_start_moves_to_active() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStartWithPassiveTcp);
    assert_eq!(fsm.state, State::Active);
}

#[test]
fn test_connect_to_open_sent_on_tcp_up() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    let effects = fsm.handle_event(Event::TcpConnectionValid);
    assert_eq!(fsm.state, State::OpenSent);
    assert!(effects.iter().any(|e| matches!(e, Effect::SendOpen(_))));
}

#[test]
fn test_open_sent_to_open_confirm_on_bgp_open() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    fsm.handle_event(Event::TcpConnectionValid);
    let peer_open = Open::new(65001, 90, Ipv4Addr::new(10, 0, 0, 2));
    let effects = fsm.handle_event(Event::BgpOpen(peer_open));
    assert_eq!(fsm.state, State::OpenConfirm);
    assert_eq!(fsm.peer_bgp_id, Some(Ipv4Addr::new(10, 0, 0, 2)));
    assert!(effects.iter().any(|e| matches!(e, Effect::SendKeepalive)));
}

#[test]
fn test_open_confirm_to_established_on_keepalive() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    fsm.handle_event(Event::TcpConnectionValid);
    fsm.handle_event(Event::BgpOpen(Open::new(65001, 90, Ipv4Addr::new(10, 0, 0, 2))));
    let effects = fsm.handle_event(Event::KeepAliveMsg);
    assert_eq!(fsm.state, State::Established);
    assert!(effects.iter().any(|e| matches!(e, Effect::SessionEstablished)));
}

#[test]
fn test_hold_timer_expiry_in_established_sends_notification_and_resets() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    fsm.handle_event(Event::TcpConnectionValid);
    fsm.handle_event(Event::BgpOpen(Open::new(65001, 90, Ipv4Addr::new(10, 0, 0, 2))));
    fsm.handle_event(Event::KeepAliveMsg);
    let effects = fsm.handle_event(Event::HoldTimerExpires);
    assert_eq!(fsm.state, State::Idle);
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::SendNotification(n) if n.error_code == NotificationErrorCode::HoldTimerExpired
    )));
    assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseRoutes)));
}

#[test]
fn test_unexpected_event_in_established_resets_to_idle() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    fsm.handle_event(Event::TcpConnectionValid);
    fsm.handle_event(Event::BgpOpen(Open::new(65001, 90, Ipv4Addr::new(10, 0, 0, 2))));
    fsm.handle_event(Event::KeepAliveMsg);
    fsm.handle_event(Event::AutomaticStart);
    assert_eq!(fsm.state, State::Idle);
}

#[test]
fn test_idle_ignores_most_events() {
    let mut fsm = test_fsm();
    let effects = fsm.handle_event(Event::KeepAliveMsg);
    assert_eq!(fsm.state, State::Idle);
    assert!(effects.is_empty());
}

#[test]
fn test_update_in_open_sent_is_rejected_with_fsm_error() {
    use crate::message::route::{Ipv4Net, Routes};
    use crate::message::path::PathAttributes;
    use crate::message::Update;

    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    fsm.handle_event(Event::TcpConnectionValid);
    let update = Update {
        withdrawn_routes: Routes::default(),
        path_attributes: PathAttributes::default(),
        nlri: Routes::from([Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 0), 24)]),
    };
    let effects = fsm.handle_event(Event::UpdateMsg(update));
    assert_eq!(fsm.state, State::Idle);
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::SendNotification(n) if n.error_code == NotificationErrorCode::FiniteStateMachineError
    )));
}

#[test]
fn test_collision_resolution_prefers_higher_identifier() {
    let a = Ipv4Addr::new(10, 0, 0, 5);
    let b = Ipv4Addr::new(10, 0, 0, 9);
    assert_eq!(resolve_collision(a, b), CollisionOutcome::KeepOther);
    assert_eq!(resolve_collision(b, a), CollisionOutcome::KeepThis);
}

#[test]
fn test_connect_retry_timer_reconnects_in_connect_state() {
    let mut fsm = test_fsm();
    fsm.handle_event(Event::ManualStart);
    let effects = fsm.handle_event(Event::ConnectRetryTimerExpires);
    assert_eq!(fsm.state, State::Connect);
    assert!(effects.iter().any(|e| matches!(e, Effect::InitiateTcpConnect)));
}
