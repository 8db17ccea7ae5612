//! Backend bring-up and the event mailbox.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use beamlink_node::config::{InitialCall, LoadPath, PathPosition};
use beamlink_node::events::Event;
use beamlink_node::{Backend, Dest, NodeError};
use beamlink_protocol::{Atom, ControlMessage, Term};

use crate::harness::{backend_config, eventually, FakePeer};

#[tokio::test]
async fn test_connect_applies_load_paths_and_startup_call() {
    let peer = FakePeer::start().await;
    let mut config = backend_config(&peer);
    config.code.load_paths = vec![
        LoadPath {
            path: "/opt/plugin/ebin".into(),
            position: PathPosition::A,
        },
        LoadPath {
            path: "/opt/extra/ebin".into(),
            position: PathPosition::Z,
        },
    ];
    config.startup.initial_call = Some(InitialCall {
        module: "plugin".into(),
        function: "start".into(),
        args: vec!["42".into(), "\"editor\"".into()],
    });

    let backend = Backend::connect(&config).await.unwrap();
    assert!(backend.is_available());
    assert_eq!(backend.peer(), &Atom::from(peer.name.as_str()));

    let calls = peer.calls();
    let functions: Vec<&str> = calls.iter().map(|c| c.function.as_str()).collect();
    assert_eq!(functions, vec!["whereis", "add_patha", "add_pathz"]);
    assert_eq!(calls[1].args, vec![Term::charlist("/opt/plugin/ebin")]);

    assert!(eventually(Duration::from_secs(1), || !peer.casts().is_empty()).await);
    let casts = peer.casts();
    let cast = &casts[0];
    assert_eq!((cast.module.as_str(), cast.function.as_str()), ("plugin", "start"));
    assert_eq!(cast.args, vec![Term::from(42), Term::binary(b"editor".to_vec())]);
    backend.dispose();
}

#[tokio::test]
async fn test_wrong_cookie_names_the_cookie() {
    let peer = FakePeer::start().await;
    let mut config = backend_config(&peer);
    config.node.cookie = Some("WRONG".into());

    let err = Backend::connect(&config).await.unwrap_err();
    assert!(matches!(err, NodeError::Authentication(_)), "{err}");
    assert!(err.to_string().contains("cookie"), "{err}");
}

#[tokio::test]
async fn test_unknown_peer_is_actionable() {
    let peer = FakePeer::start().await;
    let mut config = backend_config(&peer);
    config.peer.name = "elsewhere".into();

    let err = Backend::connect(&config).await.unwrap_err();
    assert!(matches!(err, NodeError::Connection(_)), "{err}");
    assert!(err.to_string().contains("elsewhere"), "{err}");
}

#[tokio::test]
async fn test_script_id_is_cached() {
    let peer = FakePeer::start().await;
    let backend = Backend::connect(&backend_config(&peer)).await.unwrap();

    assert_eq!(backend.script_id().await.unwrap(), "26");
    assert_eq!(backend.script_id().await.unwrap(), "26");
    let asked = peer
        .calls()
        .iter()
        .filter(|c| c.module == "init" && c.function == "script_id")
        .count();
    assert_eq!(asked, 1);
}

#[tokio::test]
async fn test_receive_event_and_send() {
    let peer = FakePeer::start().await;
    let backend = Backend::connect(&backend_config(&peer)).await.unwrap();

    peer.send_to(backend.event_pid(), Term::atom("ready"));
    let msg = backend.receive_event(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(msg, Term::atom("ready"));

    let remote = peer.make_pid();
    backend.send(&remote, Term::atom("reply")).unwrap();
    assert!(eventually(Duration::from_secs(1), || {
        peer.received().iter().any(|m| {
            matches!(m, ControlMessage::Send { to, message } if *to == remote && message.is_atom("reply"))
        })
    })
    .await);
}

#[tokio::test]
async fn test_event_handlers_see_peer_events() {
    let peer = FakePeer::start().await;
    let config = backend_config(&peer);
    let backend = Backend::connect(&config).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    backend.add_event_handler(move |ev: &Event| sink.lock().unwrap().push((ev.topic.clone(), ev.data.clone())));

    let sender = peer.make_pid();
    peer.send_to_name(
        &config.events.mailbox,
        Term::tuple(vec![
            Term::atom("event"),
            Term::atom("compile"),
            Term::atom("done"),
            Term::Pid(sender),
        ]),
    );
    assert!(eventually(Duration::from_secs(1), || !seen.lock().unwrap().is_empty()).await);
    assert_eq!(
        seen.lock().unwrap()[0],
        ("compile".to_string(), Term::atom("done"))
    );
}

#[tokio::test]
async fn test_status_handler_and_dispose() {
    let peer = FakePeer::start().await;
    let backend = Backend::connect(&backend_config(&peer)).await.unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    let subscription = backend.register_status_handler(move |peer: &Atom, up: bool| {
        sink.lock().unwrap().push((peer.clone(), up));
    });

    peer.kill_connections();
    assert!(eventually(Duration::from_secs(1), || !changes.lock().unwrap().is_empty()).await);
    assert_eq!(changes.lock().unwrap()[0], (Atom::from(peer.name.as_str()), false));
    assert!(!backend.is_available());

    // Sending while unavailable is a silent no-op
    backend.send(Dest::remote("logger", peer.name.as_str()), Term::atom("x")).unwrap();

    backend.dispose();
    assert!(backend.node().is_closed());
    assert!(eventually(Duration::from_secs(1), || !subscription.is_active()).await);
    backend.dispose();
}
