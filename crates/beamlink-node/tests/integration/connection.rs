//! Connection setup, status events and loss handling.

use std::time::Duration;

use beamlink_node::{NodeError, ReceiveError, StatusEvent};
use beamlink_protocol::{Atom, Term};

use crate::harness::{eventually, local_node, FakePeer, COOKIE, HOST};

#[tokio::test]
async fn test_ping_and_connection_info() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);

    assert!(node.ping(&peer.name).await);
    assert!(node.is_connected(&peer.name));
    assert_eq!(node.peers(), vec![Atom::from(peer.name.as_str())]);

    let info = node.connection_info(&peer.name).unwrap();
    assert_eq!(info.peer, Atom::from(peer.name.as_str()));
    assert_eq!(info.version, 6);
    node.close();
}

#[tokio::test]
async fn test_wrong_cookie_is_authentication_error() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, "NOTTHECOOKIE");

    let err = node.connect(&peer.name).await.unwrap_err();
    assert!(matches!(err, NodeError::Authentication(_)), "{err}");
    assert!(!node.is_connected(&peer.name));
    assert!(!node.ping(&peer.name).await);
}

#[tokio::test]
async fn test_unknown_node_is_connection_error() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);

    let err = node.connect(&format!("nobody@{HOST}")).await.unwrap_err();
    assert!(matches!(err, NodeError::Connection(_)), "{err}");
    assert!(err.to_string().contains("not registered"), "{err}");
    assert_eq!(peer.accepted(), 0);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_dial() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);

    let (a, b, c) = tokio::join!(
        node.connect(&peer.name),
        node.connect(&peer.name),
        node.connect(&peer.name)
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(peer.accepted(), 1);
}

#[tokio::test]
async fn test_status_events_follow_the_connection() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    let mut status = node.subscribe_status();

    node.connect(&peer.name).await.unwrap();
    let up = tokio::time::timeout(Duration::from_secs(1), status.recv()).await.unwrap().unwrap();
    assert_eq!(
        up,
        StatusEvent {
            peer: Atom::from(peer.name.as_str()),
            up: true
        }
    );

    peer.kill_connections();
    let down = tokio::time::timeout(Duration::from_secs(1), status.recv()).await.unwrap().unwrap();
    assert!(!down.up);
    assert!(!node.is_connected(&peer.name));
}

#[tokio::test]
async fn test_connection_loss_reaches_links_and_monitors() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let remote = peer.make_pid();
    let linked = node.create_mailbox(None).unwrap();
    linked.link(&remote).unwrap();
    let watcher = node.create_mailbox(None).unwrap();
    let reference = watcher.monitor(remote.clone()).unwrap();

    assert!(eventually(Duration::from_secs(1), || peer.received().len() >= 2).await);
    peer.kill_connections();

    let err = linked.receive(Some(Duration::from_secs(1))).await.unwrap_err();
    assert_eq!(
        err,
        ReceiveError::Exit {
            from: remote.clone(),
            reason: Term::atom("noconnection")
        }
    );

    let down = watcher.receive(Some(Duration::from_secs(1))).await.unwrap();
    let fields = down.tagged("DOWN", 5).unwrap();
    assert_eq!(fields[1], Term::Ref(reference));
    assert_eq!(fields[3], Term::Pid(remote));
    assert_eq!(fields[4], Term::atom("noconnection"));
}

#[tokio::test]
async fn test_reconnect_after_loss() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    peer.kill_connections();
    assert!(eventually(Duration::from_secs(1), || !node.is_connected(&peer.name)).await);

    node.connect(&peer.name).await.unwrap();
    assert!(node.is_connected(&peer.name));
    assert_eq!(peer.accepted(), 2);
}

#[tokio::test]
async fn test_disconnect_and_close() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    node.disconnect(&peer.name);
    assert!(!node.is_connected(&peer.name));
    assert!(node.peers().is_empty());

    node.connect(&peer.name).await.unwrap();
    let mailbox = node.create_mailbox(Some("worker")).unwrap();
    node.close();
    assert!(node.is_closed());
    assert!(mailbox.is_closed());
    assert!(matches!(
        node.connect(&peer.name).await,
        Err(NodeError::NoConnection(_))
    ));
}
