//! Remote calls against the fake `rex`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beamlink_node::{NodeError, RpcClient, RpcError, RpcResult};
use beamlink_protocol::{Atom, ControlMessage, ProtocolError, Target, Term, DEFAULT_PARAMS};

use crate::harness::{eventually, local_node, local_node_with_params, FakePeer, COOKIE};

async fn client(peer: &FakePeer) -> RpcClient {
    let node = local_node(peer, COOKIE);
    RpcClient::new(node, peer.name.as_str()).with_timeout(Some(Duration::from_secs(2)))
}

#[tokio::test]
async fn test_call_returns_reply() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;

    let reply = rpc.call("erlang", "node", vec![]).await.unwrap();
    assert_eq!(reply, Term::atom(&peer.name));

    let arg = Term::tuple(vec![Term::from(1), Term::binary(b"two".to_vec())]);
    let echoed = rpc.call("test", "echo", vec![arg.clone()]).await.unwrap();
    assert_eq!(echoed, arg);

    let calls = peer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].module, "test");
    assert_eq!(calls[1].args, vec![arg]);
    rpc.node().close();
}

#[tokio::test]
async fn test_badrpc_is_remote_error() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;

    let err = rpc.call("nosuch", "function", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(reason) => assert_eq!(reason, Term::atom("undef")),
        other => panic!("expected remote error, got {other:?}"),
    }
    let err = rpc.call("test", "crash", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(Term::Tuple(_))), "{err:?}");
}

#[tokio::test]
async fn test_call_timeout_cleans_up() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.node().connect(&peer.name).await.unwrap();
    let before = rpc.node().mailbox_count();

    let started = Instant::now();
    let err = rpc
        .call_timeout(Some(Duration::from_millis(50)), "test", "never", vec![])
        .await
        .unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, RpcError::Timeout), "{err:?}");
    assert!(waited >= Duration::from_millis(50), "gave up after {waited:?}");
    assert!(waited < Duration::from_millis(150), "gave up after {waited:?}");
    assert_eq!(rpc.node().mailbox_count(), before);

    // The connection survives a timed out call
    let reply = rpc.call("test", "echo", vec![Term::atom("still_here")]).await.unwrap();
    assert_eq!(reply, Term::atom("still_here"));
}

#[tokio::test]
async fn test_slow_reply_within_timeout() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    let reply = rpc
        .call_timeout(Some(Duration::from_secs(1)), "test", "slow", vec![Term::from(30)])
        .await
        .unwrap();
    assert_eq!(reply, Term::atom("slow_done"));
}

#[tokio::test]
async fn test_connection_loss_ends_pending_call() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.node().connect(&peer.name).await.unwrap();

    let call = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.call_timeout(None, "test", "never", vec![]).await })
    };
    assert!(eventually(Duration::from_secs(1), || !peer.calls().is_empty()).await);
    peer.kill_connections();

    let res = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
    assert!(matches!(res, Err(RpcError::NoConnection)), "{res:?}");
}

#[tokio::test]
async fn test_cast_uses_gen_cast_envelope() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.node().connect(&peer.name).await.unwrap();

    rpc.cast("logger", "info", vec![Term::charlist("hello")]).unwrap();
    assert!(eventually(Duration::from_secs(1), || !peer.casts().is_empty()).await);

    let casts = peer.casts();
    assert_eq!(casts[0].module, "logger");
    assert_eq!(casts[0].function, "info");
    assert_eq!(casts[0].args, vec![Term::charlist("hello")]);
    assert!(peer.calls().is_empty());
}

#[tokio::test]
async fn test_cast_before_connect_is_queued() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.cast("logger", "info", vec![]).unwrap();
    assert!(eventually(Duration::from_secs(1), || peer.casts().len() == 1).await);

    rpc.node().close();
    assert!(matches!(rpc.cast("logger", "info", vec![]), Err(RpcError::NoConnection)));
}

#[tokio::test]
async fn test_async_call_future() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.node().connect(&peer.name).await.unwrap();

    let slow = rpc.async_call("test", "slow", vec![Term::from(40)]).unwrap();
    let fast = rpc.async_call("test", "echo", vec![Term::from(7)]).unwrap();
    assert_ne!(slow.reply_to(), fast.reply_to());

    assert_eq!(fast.await.unwrap(), Term::from(7));
    assert_eq!(slow.await.unwrap(), Term::atom("slow_done"));
}

#[tokio::test]
async fn test_async_call_callback() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.node().connect(&peer.name).await.unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    rpc.async_call_cb(
        move |res| sink.lock().unwrap().push(res.map_err(|e| e.to_string())),
        "nosuch",
        "function",
        vec![],
    )
    .unwrap();

    assert!(eventually(Duration::from_secs(1), || !results.lock().unwrap().is_empty()).await);
    let res = results.lock().unwrap().remove(0);
    assert!(res.is_err());
}

#[tokio::test]
async fn test_async_call_times_out_and_ignores_late_reply() {
    let peer = FakePeer::start().await;
    let rpc = RpcClient::new(local_node(&peer, COOKIE), peer.name.as_str())
        .with_timeout(Some(Duration::from_millis(30)));
    rpc.node().connect(&peer.name).await.unwrap();

    let pending = rpc.async_call("test", "slow", vec![Term::from(150)]).unwrap();
    assert_eq!(rpc.node().pending_calls(&peer.name), 1);
    assert!(matches!(pending.await, Err(RpcError::Timeout)));
    assert_eq!(rpc.node().pending_calls(&peer.name), 0);

    // The late reply is dropped and the connection carries on
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rpc.node().is_connected(&peer.name));
    assert_eq!(rpc.node().pending_calls(&peer.name), 0);
    let reply = rpc
        .call_timeout(Some(Duration::from_secs(1)), "test", "echo", vec![Term::from(1)])
        .await
        .unwrap();
    assert_eq!(reply, Term::from(1));
}

#[tokio::test]
async fn test_async_call_fails_when_connection_drops() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;
    rpc.node().connect(&peer.name).await.unwrap();

    let pending = rpc.async_call("test", "never", vec![]).unwrap();
    assert!(eventually(Duration::from_secs(1), || !peer.calls().is_empty()).await);
    peer.kill_connections();
    let res = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap();
    assert!(matches!(res, Err(RpcError::NoConnection)), "{res:?}");
}

#[tokio::test]
async fn test_call_sig_rejects_before_sending() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;

    let err = rpc
        .call_sig("test", "echo", "ia", vec![Term::from(1), Term::from(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Signature(_)), "{err:?}");
    assert_eq!(peer.accepted(), 0);

    let reply = rpc
        .call_sig("test", "echo", "i", vec![Term::from(5)])
        .await
        .unwrap();
    assert_eq!(reply, Term::from(5));
}

#[tokio::test]
async fn test_call_noexception() {
    let peer = FakePeer::start().await;
    let rpc = client(&peer).await;

    match rpc.call_noexception(None, "file", "open", vec![Term::charlist("/nope")]).await {
        RpcResult::Error(reason) => assert_eq!(reason, Term::atom("enoent")),
        other => panic!("expected error tuple, got {other:?}"),
    }
    let ok = rpc.call_noexception(None, "test", "echo", vec![Term::atom("x")]).await;
    assert!(ok.is_ok());
    assert_eq!(ok.into_result().unwrap(), Term::atom("x"));

    let failed = rpc
        .call_noexception(Some(Duration::from_millis(20)), "test", "never", vec![])
        .await;
    assert!(matches!(failed, RpcResult::Failure(RpcError::Timeout)));
}

#[tokio::test]
async fn test_monitor_unregistered_remote_name_is_noproc() {
    let peer = FakePeer::start().await;
    let node = local_node(&peer, COOKIE);
    node.connect(&peer.name).await.unwrap();

    let mailbox = node.create_mailbox(None).unwrap();
    let reference = mailbox
        .monitor(beamlink_node::Dest::remote("no_such_server", peer.name.as_str()))
        .unwrap();
    let down = mailbox.receive(Some(Duration::from_secs(1))).await.unwrap();
    let fields = down.tagged("DOWN", 5).unwrap();
    assert_eq!(fields[1], Term::Ref(reference));
    assert_eq!(fields[4], Term::atom("noproc"));

    assert!(peer.received().iter().any(|m| matches!(
        m,
        ControlMessage::MonitorP { to: Target::Name(name), .. } if *name == Atom::from("no_such_server")
    )));
}

#[tokio::test]
async fn test_oversized_send_leaves_connection_and_calls_alone() {
    let peer = FakePeer::start().await;
    let mut params = DEFAULT_PARAMS;
    params.max_frame_bytes = 4 * 1024;
    let node = local_node_with_params(&peer, COOKIE, params);
    let rpc = RpcClient::new(node.clone(), peer.name.as_str()).with_timeout(Some(Duration::from_secs(2)));
    node.connect(&peer.name).await.unwrap();

    let pending = rpc.async_call("test", "slow", vec![Term::from(50)]).unwrap();
    let mailbox = node.create_mailbox(None).unwrap();
    let err = mailbox
        .send(&peer.make_pid(), Term::binary(vec![0u8; 8 * 1024]))
        .unwrap_err();
    assert!(
        matches!(err, NodeError::Protocol(ProtocolError::FrameTooLarge { .. })),
        "{err}"
    );

    assert!(node.is_connected(&peer.name));
    assert_eq!(pending.await.unwrap(), Term::atom("slow_done"));
    mailbox.send(&peer.make_pid(), Term::atom("small")).unwrap();
    assert!(node.is_connected(&peer.name));
}
