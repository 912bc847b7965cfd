mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use ingest_rtc::error::{NegotiationError, RelayError};
use ingest_rtc::{Bridge, ConnectionState, RelayEnd, SdpKind};

const OFFER: &str = "v=0\r\no=browser 1 1 IN IP4 127.0.0.1\r\ns=-\r\n";

fn bridge_with(session: &Arc<FakeSession>, dialer: Arc<FakeDialer>) -> Arc<Bridge> {
    Bridge::new(
        "rtmp://ingest/live/key",
        session.clone(),
        dialer,
        Box::new(FakeTransform::new(1, Duration::ZERO)),
    )
}

#[test]
fn local_description_is_created_once() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    let first = bridge.local_description(SdpKind::Answer).unwrap();
    let second = bridge.local_description(SdpKind::Offer).unwrap();

    assert_eq!(first, second);
    assert_eq!(session.creates(), 1);
}

#[test]
fn remote_description_is_replaced() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());
    assert_eq!(bridge.remote_description(), None);

    bridge.set_remote_description(OFFER, SdpKind::Offer).unwrap();
    let renegotiated = format!("{OFFER}a=ice-restart\r\n");
    bridge
        .set_remote_description(&renegotiated, SdpKind::Offer)
        .unwrap();

    assert_eq!(bridge.remote_description(), Some(renegotiated));
    assert_eq!(session.remote.lock().unwrap().len(), 2);
}

#[test]
fn rejected_remote_description_keeps_the_previous_one() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    bridge.set_remote_description(OFFER, SdpKind::Offer).unwrap();
    let err = bridge
        .set_remote_description("garbage", SdpKind::Offer)
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Malformed(_)));
    assert_eq!(bridge.remote_description().as_deref(), Some(OFFER));
}

#[test]
fn connected_starts_the_relay_once() {
    let session = FakeSession::new();
    let (conn, tx) = FakeConnection::new(vec![video_stream(0)]);
    let dialer = FakeDialer::new(conn);
    let bridge = bridge_with(&session, dialer.clone());

    session.fire(ConnectionState::Connecting);
    assert!(!bridge.relay_started());

    session.fire(ConnectionState::Connected);
    session.fire(ConnectionState::Connected);
    assert!(bridge.relay_started());
    assert_eq!(bridge.connection_state(), ConnectionState::Connected);

    tx.send(video_packet(0, 0, true, avcc(&[&[0x65, 0x88]])))
        .unwrap();
    drop(tx);

    let report = bridge.wait().unwrap().unwrap();
    assert_eq!(report.end, RelayEnd::EndOfStream);
    assert_eq!(report.video_samples, 1);
    assert_eq!(session.video.len(), 1);
    assert_eq!(dialer.dials(), 1);
    assert!(bridge.wait().is_none());
}

#[test]
fn disconnected_does_not_close() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    session.fire(ConnectionState::Disconnected);

    assert!(!bridge.is_closed());
    assert!(!bridge.relay_started());
    assert_eq!(session.closes(), 0);
}

#[test]
fn failed_closes_the_bridge() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    session.fire(ConnectionState::Failed);

    assert!(bridge.is_closed());
    assert_eq!(session.closes(), 1);
    assert_eq!(bridge.connection_state(), ConnectionState::Failed);
}

#[test]
fn connect_failure_surfaces_from_wait() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    session.fire(ConnectionState::Connected);

    assert!(matches!(bridge.wait(), Some(Err(RelayError::Connect(_)))));
    assert_eq!(session.video.len(), 0);
}

#[test]
fn close_releases_each_resource_once() {
    let session = FakeSession::new();
    let (conn, tx) = FakeConnection::new(vec![video_stream(0)]);
    let bridge = bridge_with(&session, FakeDialer::new(conn.clone()));

    session.fire(ConnectionState::Connected);
    tx.send(video_packet(0, 0, true, avcc(&[&[0x65, 0x88]])))
        .unwrap();
    assert!(wait_until(|| session.video.len() == 1));

    bridge.close();
    bridge.close();

    let report = bridge.wait().unwrap().unwrap();
    assert_eq!(report.end, RelayEnd::Closed);
    assert_eq!(session.closes(), 1);
    assert_eq!(conn.closes(), 1);
}

#[test]
fn concurrent_close_releases_each_resource_once() {
    let session = FakeSession::new();
    let (conn, tx) = FakeConnection::new(vec![video_stream(0)]);
    let bridge = bridge_with(&session, FakeDialer::new(conn.clone()));

    session.fire(ConnectionState::Connected);
    tx.send(video_packet(0, 0, true, avcc(&[&[0x65, 0x88]])))
        .unwrap();
    assert!(wait_until(|| session.video.len() == 1));

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.close())
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    assert_eq!(bridge.wait().unwrap().unwrap().end, RelayEnd::Closed);
    assert_eq!(session.closes(), 1);
    assert_eq!(conn.closes(), 1);
}

#[test]
fn close_before_connect_never_dials() {
    let session = FakeSession::new();
    let (conn, _tx) = FakeConnection::new(vec![video_stream(0)]);
    let dialer = FakeDialer::new(conn.clone());
    let bridge = bridge_with(&session, dialer.clone());

    bridge.close();
    session.fire(ConnectionState::Connected);

    assert!(!bridge.relay_started());
    assert!(bridge.wait().is_none());
    assert_eq!(dialer.dials(), 0);
    assert_eq!(conn.closes(), 0);
    assert_eq!(session.closes(), 1);
}

#[test]
fn negotiation_after_close_is_rejected() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    bridge.close();

    assert!(matches!(
        bridge.local_description(SdpKind::Answer),
        Err(NegotiationError::Closed)
    ));
    assert!(matches!(
        bridge.set_remote_description(OFFER, SdpKind::Offer),
        Err(NegotiationError::Closed)
    ));
    assert_eq!(session.creates(), 0);
}

#[test]
fn failing_session_release_still_releases_upstream() {
    let session = FakeSession::new();
    session.fail_close.store(true, Ordering::SeqCst);
    let (conn, tx) = FakeConnection::new(vec![video_stream(0)]);
    let bridge = bridge_with(&session, FakeDialer::new(conn.clone()));

    session.fire(ConnectionState::Connected);
    tx.send(video_packet(0, 0, false, avcc(&[&[0x41, 0x9a]])))
        .unwrap();
    assert!(wait_until(|| session.video.len() == 1));

    bridge.close();

    assert_eq!(bridge.wait().unwrap().unwrap().end, RelayEnd::Closed);
    assert_eq!(session.closes(), 1);
    assert_eq!(conn.closes(), 1);
}

#[test]
fn dropping_the_bridge_closes_the_session() {
    let session = FakeSession::new();
    let bridge = bridge_with(&session, FakeDialer::refusing());

    drop(bridge);

    assert_eq!(session.closes(), 1);
    // The listener outlives the bridge and must not resurrect it.
    session.fire(ConnectionState::Failed);
    assert_eq!(session.closes(), 1);
}
