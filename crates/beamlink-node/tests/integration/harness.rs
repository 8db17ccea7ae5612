//! Test harness for in-process beamlink integration tests.
//!
//! FakePeer stands in for a peer runtime: a discovery service on its own port
//! that knows one node, an acceptor running the real handshake, and a `rex`
//! server that answers calls through a responder function.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, FramedParts};

use beamlink_crypto::Cookie;
use beamlink_node::config::NodeConfig;
use beamlink_node::handshake::{self, LocalIdentity};
use beamlink_node::Node;
use beamlink_protocol::{
    decode_message, encode_message, epmd, flags, Atom, ControlMessage, DistCodec, DistParams, Frame,
    Pid, Target, Term, DEFAULT_PARAMS,
};

pub const PEER_ALIVE: &str = "backend";
pub const HOST: &str = "127.0.0.1";
pub const COOKIE: &str = "SECRETCOOKIE";

/// How the fake `rex` answers one call.
#[allow(dead_code)]
pub enum Reply {
    Now(Term),
    After(Duration, Term),
    Never,
}

pub type Responder = Arc<dyn Fn(&str, &str, &[Term]) -> Reply + Send + Sync>;

/// A remote call or cast as the fake peer saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub module: String,
    pub function: String,
    pub args: Vec<Term>,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Request>>,
    casts: Mutex<Vec<Request>>,
    received: Mutex<Vec<ControlMessage>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
    accepted: AtomicUsize,
    next_pid: AtomicU32,
}

pub struct FakePeer {
    pub name: String,
    pub epmd_port: u16,
    pub dist_port: u16,
    creation: u32,
    shared: Arc<Shared>,
    kill_tx: broadcast::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Answers used by most tests.
pub fn default_responder() -> Responder {
    Arc::new(|module: &str, function: &str, args: &[Term]| match (module, function) {
        ("erlang", "node") => Reply::Now(Term::atom(&format!("{PEER_ALIVE}@{HOST}"))),
        ("erlang", "whereis") => Reply::Now(Term::Pid(Pid::new(format!("{PEER_ALIVE}@{HOST}"), 40, 0, 1))),
        ("init", "script_id") => Reply::Now(Term::tuple(vec![
            Term::charlist("OTP  APN 181 01"),
            Term::charlist("26"),
        ])),
        ("code", "add_patha" | "add_pathz") => Reply::Now(Term::atom("true")),
        ("code", "del_path") => Reply::Now(Term::atom("false")),
        ("file", "open") => Reply::Now(Term::tuple(vec![Term::atom("error"), Term::atom("enoent")])),
        ("test", "echo") => Reply::Now(args.first().cloned().unwrap_or_else(Term::nil)),
        ("test", "slow") => {
            let ms = match args.first() {
                Some(Term::Integer(ms)) => *ms as u64,
                _ => 100,
            };
            Reply::After(Duration::from_millis(ms), Term::atom("slow_done"))
        }
        ("test", "never") => Reply::Never,
        ("test", "crash") => Reply::Now(Term::tuple(vec![
            Term::atom("badrpc"),
            Term::tuple(vec![Term::atom("EXIT"), Term::atom("boom")]),
        ])),
        _ => Reply::Now(Term::tuple(vec![Term::atom("badrpc"), Term::atom("undef")])),
    })
}

#[allow(dead_code)]
impl FakePeer {
    pub async fn start() -> Self {
        Self::start_with(COOKIE, default_responder()).await
    }

    pub async fn start_with(cookie: &str, responder: Responder) -> Self {
        let name = format!("{PEER_ALIVE}@{HOST}");
        let creation = 0x5eed;
        let shared = Arc::new(Shared::default());
        let (kill_tx, _) = broadcast::channel(4);

        let dist = TcpListener::bind((HOST, 0)).await.unwrap();
        let dist_port = dist.local_addr().unwrap().port();
        let epmd_listener = TcpListener::bind((HOST, 0)).await.unwrap();
        let epmd_port = epmd_listener.local_addr().unwrap().port();

        let identity = LocalIdentity {
            name: Atom::from(name.as_str()),
            flags: flags::DEFAULT_FLAGS,
            creation,
            cookie: Cookie::new(cookie).unwrap(),
        };

        let mut handles = Vec::new();
        handles.push(tokio::spawn(serve_epmd(epmd_listener, dist_port)));
        {
            let shared = Arc::clone(&shared);
            let kill_tx = kill_tx.clone();
            handles.push(tokio::spawn(async move {
                while let Ok((stream, _)) = dist.accept().await {
                    shared.accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        stream,
                        identity.clone(),
                        Arc::clone(&responder),
                        Arc::clone(&shared),
                        kill_tx.subscribe(),
                    ));
                }
            }));
        }

        FakePeer {
            name,
            epmd_port,
            dist_port,
            creation,
            shared,
            kill_tx,
            handles,
        }
    }

    /// A pid on the fake peer.
    pub fn make_pid(&self) -> Pid {
        let id = self.shared.next_pid.fetch_add(1, Ordering::SeqCst) + 100;
        Pid::new(self.name.as_str(), id, 0, self.creation)
    }

    /// Connections accepted so far, including failed handshakes.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Request> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn casts(&self) -> Vec<Request> {
        self.shared.casts.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<ControlMessage> {
        self.shared.received.lock().unwrap().clone()
    }

    /// Push a control message down the live connection.
    pub fn push(&self, msg: ControlMessage) {
        let outbound = self.shared.outbound.lock().unwrap();
        outbound
            .as_ref()
            .expect("no live connection")
            .send(msg)
            .expect("connection task gone");
    }

    pub fn send_to(&self, to: &Pid, message: Term) {
        self.push(ControlMessage::Send {
            to: to.clone(),
            message,
        });
    }

    pub fn send_to_name(&self, name: &str, message: Term) {
        let from = self.make_pid();
        self.push(ControlMessage::RegSend {
            from,
            to_name: Atom::from(name),
            message,
        });
    }

    /// Drop every live connection without a goodbye.
    pub fn kill_connections(&self) {
        let _ = self.kill_tx.send(());
        self.shared.outbound.lock().unwrap().take();
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        let _ = self.kill_tx.send(());
        for h in &self.handles {
            h.abort();
        }
    }
}

async fn serve_epmd(listener: TcpListener, dist_port: u16) {
    let service_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    while let Ok((mut sock, _)) = listener.accept().await {
        tokio::spawn(async move {
            // Liveness probes connect and hang up
            let Ok(len) = sock.read_u16().await else { return };
            let mut req = vec![0u8; len as usize];
            if sock.read_exact(&mut req).await.is_err() {
                return;
            }
            let resp = match req.first() {
                Some(&epmd::PORT_PLEASE2_REQ) if &req[1..] == PEER_ALIVE.as_bytes() => {
                    epmd::encode_port2_resp(Some(&epmd::NodeEntry {
                        port: dist_port,
                        node_type: epmd::NODE_TYPE_NORMAL,
                        protocol: 0,
                        highest_version: 6,
                        lowest_version: 5,
                        name: PEER_ALIVE.into(),
                        extra: vec![],
                    }))
                }
                Some(&epmd::PORT_PLEASE2_REQ) => epmd::encode_port2_resp(None),
                Some(&epmd::NAMES_REQ) => {
                    epmd::encode_names_resp(u32::from(service_port), &[(PEER_ALIVE.into(), dist_port)])
                }
                _ => return,
            };
            let _ = sock.write_all(&resp).await;
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    identity: LocalIdentity,
    responder: Responder,
    shared: Arc<Shared>,
    mut kill: broadcast::Receiver<()>,
) {
    let Ok(est) = handshake::accept(stream, &identity, Duration::from_secs(5)).await else {
        return;
    };
    let mut parts = FramedParts::new::<Frame>(est.io, DistCodec::default());
    parts.read_buf = est.read_buf;
    let mut framed = Framed::from_parts(parts);

    let (tx, mut rx) = mpsc::unbounded_channel();
    *shared.outbound.lock().unwrap() = Some(tx.clone());

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            Some(msg) = rx.recv() => {
                let frame = encode_message(&msg).unwrap();
                if framed.send(frame).await.is_err() {
                    break;
                }
            }
            frame = framed.next() => {
                let body = match frame {
                    Some(Ok(Frame::Data(body))) => body,
                    Some(Ok(Frame::Tick)) => {
                        let _ = framed.send(Frame::Tick).await;
                        continue;
                    }
                    _ => break,
                };
                let Ok(msg) = decode_message(&body) else { break };
                shared.received.lock().unwrap().push(msg.clone());
                handle(msg, &responder, &shared, &tx);
            }
        }
    }
}

fn request_of(term: &Term, tag: &str) -> Option<Request> {
    let fields = term.tagged(tag, 5)?;
    Some(Request {
        module: fields[1].as_atom()?.as_str().to_string(),
        function: fields[2].as_atom()?.as_str().to_string(),
        args: fields[3].as_list().map(<[Term]>::to_vec).unwrap_or_default(),
    })
}

fn handle(
    msg: ControlMessage,
    responder: &Responder,
    shared: &Shared,
    tx: &mpsc::UnboundedSender<ControlMessage>,
) {
    match msg {
        ControlMessage::RegSend { to_name, message, .. } if to_name == "rex" => {
            // {ReplyPid, {call, M, F, A, GL}}
            if let Some([Term::Pid(reply_to), call]) = message.as_tuple() {
                let Some(req) = request_of(call, "call") else { return };
                shared.calls.lock().unwrap().push(req.clone());
                let wrap = |reply: Term| ControlMessage::Send {
                    to: reply_to.clone(),
                    message: Term::tuple(vec![Term::atom("rex"), reply]),
                };
                match responder(&req.module, &req.function, &req.args) {
                    Reply::Now(reply) => {
                        let _ = tx.send(wrap(reply));
                    }
                    Reply::After(delay, reply) => {
                        let tx = tx.clone();
                        let msg = wrap(reply);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(msg);
                        });
                    }
                    Reply::Never => {}
                }
                return;
            }
            // {'$gen_cast', {cast, M, F, A, GL}}
            if let Some(fields) = message.tagged("$gen_cast", 2) {
                if let Some(req) = request_of(&fields[1], "cast") {
                    shared.casts.lock().unwrap().push(req);
                }
            }
        }
        ControlMessage::MonitorP {
            from,
            to: Target::Name(name),
            reference,
        } if name != "rex" => {
            let _ = tx.send(ControlMessage::MonitorPExit {
                from: Target::Name(name),
                to: from,
                reference,
                reason: Term::atom("noproc"),
            });
        }
        _ => {}
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Local node pointed at the fake peer's discovery service.
pub fn local_node(peer: &FakePeer, cookie: &str) -> Node {
    local_node_with_params(peer, cookie, DEFAULT_PARAMS)
}

/// Like `local_node`, starting from `params` instead of the defaults.
pub fn local_node_with_params(peer: &FakePeer, cookie: &str, mut params: DistParams) -> Node {
    params.epmd_port = peer.epmd_port;
    params.default_rpc_timeout_ms = 2_000;
    params.handshake_timeout_ms = 2_000;
    let name = format!("tool_{}@{HOST}", rand_suffix());
    Node::with_params(&name, Cookie::new(cookie).unwrap(), params).unwrap()
}

/// Backend config pointed at the fake peer.
pub fn backend_config(peer: &FakePeer) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.name = "tool".into();
    cfg.node.host = HOST.into();
    cfg.node.cookie = Some(COOKIE.into());
    cfg.peer.name = PEER_ALIVE.into();
    cfg.peer.host = HOST.into();
    cfg.distribution.epmd_port = Some(peer.epmd_port);
    cfg.distribution.discovery_interval_ms = Some(10);
    cfg.distribution.discovery_max_tries = Some(20);
    cfg
}

fn rand_suffix() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::SeqCst)
}
