//! Messages and signals between local mailboxes and the fake peer.

use std::time::Duration;

use beamlink_node::{Dest, ReceiveError};
use beamlink_protocol::{ControlMessage, Term};

use crate::harness::{eventually, local_node, FakePeer, COOKIE};

#[tokio::test]
async fn test_remote_send_by_pid_and_name() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let by_pid = node.create_mailbox(None).unwrap();
    let by_name = node.create_mailbox(Some("editor")).unwrap();

    peer.send_to(by_pid.pid(), Term::atom("hello"));
    peer.send_to_name("editor", Term::atom("named"));
    peer.send_to_name("nobody_here", Term::atom("lost"));

    let timeout = Some(Duration::from_secs(1));
    assert_eq!(by_pid.receive(timeout).await.unwrap(), Term::atom("hello"));
    assert_eq!(by_name.receive(timeout).await.unwrap(), Term::atom("named"));
    assert_eq!(
        by_name.receive(Some(Duration::from_millis(30))).await,
        Err(ReceiveError::Timeout)
    );
}

#[tokio::test]
async fn test_messages_keep_their_order() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let mailbox = node.create_mailbox(None).unwrap();
    for i in 0..50 {
        peer.send_to(mailbox.pid(), Term::from(i));
    }
    for i in 0..50 {
        let msg = mailbox.receive(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(msg, Term::from(i));
    }

    // Outbound order holds as well
    let target = peer.make_pid();
    for i in 0..50 {
        mailbox.send(&target, Term::from(i)).unwrap();
    }
    assert!(eventually(Duration::from_secs(1), || peer.received().len() >= 50).await);
    let sent: Vec<Term> = peer
        .received()
        .into_iter()
        .filter_map(|m| match m {
            ControlMessage::Send { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(sent, (0..50).map(Term::from).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_selective_receive_leaves_others_queued() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let mailbox = node.create_mailbox(None).unwrap();
    peer.send_to(mailbox.pid(), Term::atom("first"));
    peer.send_to(mailbox.pid(), Term::tuple(vec![Term::atom("wanted"), Term::from(1)]));
    peer.send_to(mailbox.pid(), Term::atom("last"));

    let timeout = Some(Duration::from_secs(1));
    let wanted = mailbox
        .receive_matching(|m| m.tagged("wanted", 2).is_some(), timeout)
        .await
        .unwrap();
    assert_eq!(wanted.as_tuple().unwrap()[1], Term::from(1));
    assert_eq!(mailbox.receive(timeout).await.unwrap(), Term::atom("first"));
    assert_eq!(mailbox.receive(timeout).await.unwrap(), Term::atom("last"));
}

#[tokio::test]
async fn test_remote_exit_over_link() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let remote = peer.make_pid();
    let mailbox = node.create_mailbox(Some("worker")).unwrap();
    mailbox.link(&remote).unwrap();
    assert!(eventually(Duration::from_secs(1), || {
        peer.received()
            .iter()
            .any(|m| matches!(m, ControlMessage::Link { .. }))
    })
    .await);

    peer.push(ControlMessage::Exit {
        from: remote.clone(),
        to: mailbox.pid().clone(),
        reason: Term::atom("shutdown"),
    });
    let err = mailbox.receive(Some(Duration::from_secs(1))).await.unwrap_err();
    assert_eq!(
        err,
        ReceiveError::Exit {
            from: remote,
            reason: Term::atom("shutdown")
        }
    );
    assert!(mailbox.is_closed());
    assert_eq!(node.whereis("worker"), None);
}

#[tokio::test]
async fn test_local_exit_reaches_remote_link() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let remote = peer.make_pid();
    let mailbox = node.create_mailbox(None).unwrap();
    mailbox.link(&remote).unwrap();
    let local = mailbox.pid().clone();
    mailbox.exit(Term::atom("crashed"));

    assert!(eventually(Duration::from_secs(1), || {
        peer.received().iter().any(|m| {
            matches!(m, ControlMessage::Exit { from, to, reason }
                if *from == local && *to == remote && reason.is_atom("crashed"))
        })
    })
    .await);
}

#[tokio::test]
async fn test_send_to_remote_registered_name() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let mailbox = node.create_mailbox(None).unwrap();
    mailbox
        .send(Dest::remote("logger", peer.name.as_str()), Term::atom("ping"))
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || {
        peer.received().iter().any(|m| {
            matches!(m, ControlMessage::RegSend { to_name, message, from }
                if to_name.as_str() == "logger" && message.is_atom("ping") && from == mailbox.pid())
        })
    })
    .await);
}
