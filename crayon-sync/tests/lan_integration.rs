//! Integration tests for the LAN transport over loopback.
//!
//! Discovery is disabled and peers are joined with manual invitations, so
//! these exercise the real TCP, WebSocket and Noise path without multicast.

use std::net::SocketAddr;
use std::time::Duration;

use crayon_sync::{
    Envelope, LanTransport, Pose, SessionConfig, SessionTransport, SyncCoordinator, SyncEvent,
};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

type Node = (SyncCoordinator<LanTransport>, mpsc::Receiver<SyncEvent>);

fn loopback_node(name: &str) -> Node {
    let config = SessionConfig {
        discovery: false,
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        invite_timeout: Duration::from_secs(2),
        ..SessionConfig::with_display_name(name)
    };
    SyncCoordinator::new(LanTransport::new(config).unwrap())
}

fn session_addr(node: &Node) -> SocketAddr {
    node.0.transport().local_addr().expect("session not started")
}

async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for_roster(rx: &mut mpsc::Receiver<SyncEvent>, expected: &[&str]) {
    loop {
        if let SyncEvent::RosterChanged(roster) = next_event(rx).await {
            if roster == expected {
                return;
            }
        }
    }
}

async fn connected_pair() -> (Node, Node) {
    let mut a = loopback_node("Alice");
    let mut b = loopback_node("Bob");
    a.0.start().unwrap();
    b.0.start().unwrap();
    assert!(a.0.transport().invite(session_addr(&b)));
    wait_for_roster(&mut a.1, &["Bob"]).await;
    wait_for_roster(&mut b.1, &["Alice"]).await;
    (a, b)
}

#[tokio::test]
async fn test_invite_connects_both_sides() {
    let (a, b) = connected_pair().await;
    assert_eq!(a.0.transport().connected_peers(), vec![b.0.transport().peer_id()]);
    assert_eq!(b.0.transport().connected_peers(), vec![a.0.transport().peer_id()]);
    assert_eq!(a.0.transport().stats().invitations_sent, 1);
    assert_eq!(b.0.transport().stats().invitations_accepted, 1);
}

#[tokio::test]
async fn test_sync_and_pose_over_encrypted_link() {
    let ((a, _events_a), (_b, mut events_b)) = connected_pair().await;
    let id_a = a.transport().peer_id();

    assert_eq!(a.broadcast_sync(Pose::IDENTITY), 1);
    assert_eq!(
        next_event(&mut events_b).await,
        SyncEvent::SyncReceived { from: id_a, pose: Pose::IDENTITY }
    );

    let other = Pose::from_translation(-1.0, 0.5, 2.25);
    assert_eq!(a.broadcast_pose(other), 1);
    assert_eq!(
        next_event(&mut events_b).await,
        SyncEvent::PoseUpdate { from: id_a, pose: other }
    );
}

#[tokio::test]
async fn test_poses_flow_both_ways_in_order() {
    let ((a, mut events_a), (b, mut events_b)) = connected_pair().await;

    for frame in 0..10 {
        a.broadcast_pose(Pose::from_translation(frame as f32, 0.0, 0.0));
        b.broadcast_pose(Pose::from_translation(0.0, frame as f32, 0.0));
    }
    for frame in 0..10 {
        match next_event(&mut events_b).await {
            SyncEvent::PoseUpdate { pose, .. } => assert_eq!(pose.translation()[0], frame as f32),
            other => panic!("unexpected event {other:?}"),
        }
        match next_event(&mut events_a).await {
            SyncEvent::PoseUpdate { pose, .. } => assert_eq!(pose.translation()[1], frame as f32),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_shutdown_sends_goodbye() {
    let ((a, mut events_a), (b, _events_b)) = connected_pair().await;

    b.shutdown();
    wait_for_roster(&mut events_a, &[]).await;
    assert!(a.transport().connected_peers().is_empty());
    assert_eq!(a.broadcast_pose(Pose::IDENTITY), 0);
}

#[tokio::test]
async fn test_plaintext_client_gets_nothing_through() {
    let (a, mut events_a) = loopback_node("Alice");
    a.start().unwrap();

    let url = format!("ws://{}/location-share", a.transport().local_addr().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let payload = Envelope::sync_ping(Pose::IDENTITY).encode();
    let _ = ws.send(Message::Binary(payload.into())).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events_a.try_recv().is_err());
    assert!(a.roster().is_empty());
}

#[tokio::test]
async fn test_unreachable_invite_leaves_roster_empty() {
    let (a, mut events_a) = loopback_node("Alice");
    a.start().unwrap();

    // Bind and drop to get a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    assert!(a.transport().invite(SocketAddr::from(([127, 0, 0, 1], port))));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events_a.try_recv().is_err());
    assert!(a.transport().connected_peers().is_empty());
}

#[tokio::test]
#[ignore = "needs a multicast-capable network interface"]
async fn test_multicast_discovery_connects_peers() {
    let service = SessionConfig {
        service_type: "crayon-test".into(),
        ..SessionConfig::default()
    };
    let (a, mut events_a) = SyncCoordinator::new(
        LanTransport::new(SessionConfig {
            display_name: "Alice".into(),
            ..service.clone()
        })
        .unwrap(),
    );
    let (b, mut events_b) = SyncCoordinator::new(
        LanTransport::new(SessionConfig {
            display_name: "Bob".into(),
            ..service
        })
        .unwrap(),
    );
    a.start().unwrap();
    b.start().unwrap();

    wait_for_roster(&mut events_a, &["Bob"]).await;
    wait_for_roster(&mut events_b, &["Alice"]).await;
    assert_eq!(a.broadcast_sync(Pose::IDENTITY), 1);
}
