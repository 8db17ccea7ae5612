//! Connections -- one live socket per peer node.
//!
//! The read half is owned by a decode loop, the write half by a writer task
//! fed from an ordered outbound queue. Queueing a frame is the only thing a
//! sender does, so frames from one sender keep their order and never
//! interleave. A ticker keeps the peer's liveness check happy and the decode
//! loop closes the connection after `net_ticktime` of silence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{Framed, FramedParts};

use beamlink_protocol::{
    decode_message, Atom, DistCodec, Frame, Pid, ProtocolError, Term, DEFAULT_PARAMS,
};

use crate::handshake::{ConnectionInfo, Established};
use crate::node::{Node, NodeInner};
use crate::rpc::{unwrap_reply, RpcError};
use crate::NodeError;

/// How many leading bytes of a bad frame end up in the log.
const DUMP_BYTES: usize = 64;

/// Why a dial never produced a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialFailure {
    pub authentication: bool,
    pub message: String,
}

impl DialFailure {
    pub(crate) fn from_error(err: &NodeError) -> Self {
        Self {
            authentication: matches!(err, NodeError::Authentication(_)),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Up,
    /// Closed; carries the dial failure if it never came up.
    Down(Option<DialFailure>),
}

// ============================================================================
// Pending async calls
// ============================================================================

pub(crate) type Callback = Box<dyn FnOnce(Result<Term, RpcError>) + Send>;

pub(crate) enum ReplySlot {
    Future(tokio::sync::oneshot::Sender<Result<Term, RpcError>>),
    Callback(Callback),
}

/// An async call waiting for its reply, keyed by the reply pid.
pub(crate) struct PendingCall {
    slot: ReplySlot,
}

impl PendingCall {
    pub(crate) fn new(slot: ReplySlot) -> Self {
        Self { slot }
    }

    pub(crate) fn complete(self, result: Result<Term, RpcError>) {
        match self.slot {
            ReplySlot::Future(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!("rpc: caller dropped its future before the reply");
                }
            }
            ReplySlot::Callback(cb) => cb(result),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct Connection {
    peer: Atom,
    outbound: mpsc::UnboundedSender<Frame>,
    /// Largest data frame body the peer will take.
    max_frame: usize,
    /// Held until the socket is up, then owned by the writer task.
    queued: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    info: OnceLock<ConnectionInfo>,
    pending: Mutex<HashMap<Pid, PendingCall>>,
    state: watch::Sender<ConnState>,
    shutdown: broadcast::Sender<()>,
}

impl Connection {
    #[cfg(test)]
    pub(crate) fn new(peer: Atom) -> Self {
        Self::with_max_frame(peer, DEFAULT_PARAMS.max_frame_bytes)
    }

    pub(crate) fn with_max_frame(peer: Atom, max_frame: usize) -> Self {
        let (outbound, queued) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnState::Connecting);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            peer,
            outbound,
            max_frame,
            queued: Mutex::new(Some(queued)),
            info: OnceLock::new(),
            pending: Mutex::new(HashMap::new()),
            state,
            shutdown,
        }
    }

    pub fn peer(&self) -> &Atom {
        &self.peer
    }

    /// Negotiated version, flags and creation, once the handshake is done.
    pub fn info(&self) -> Option<&ConnectionInfo> {
        self.info.get()
    }

    pub fn state(&self) -> ConnState {
        self.state.borrow().clone()
    }

    pub fn is_up(&self) -> bool {
        matches!(*self.state.borrow(), ConnState::Up)
    }

    pub fn is_down(&self) -> bool {
        matches!(*self.state.borrow(), ConnState::Down(_))
    }

    /// Wait for the dial to finish.
    pub async fn wait_up(&self) -> Result<(), NodeError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, ConnState::Connecting))
            .await
            .map(|s| s.clone())
            .map_err(|_| NodeError::NoConnection(self.peer.to_string()))?;
        match state {
            ConnState::Up => Ok(()),
            ConnState::Down(Some(f)) if f.authentication => Err(NodeError::Authentication(f.message)),
            ConnState::Down(Some(f)) => Err(NodeError::Connection(f.message)),
            _ => Err(NodeError::NoConnection(self.peer.to_string())),
        }
    }

    /// Put a frame on the outbound queue. Oversized frames are refused here,
    /// so the writer never meets one and the connection stays up.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<(), NodeError> {
        if self.is_down() {
            return Err(NodeError::NoConnection(self.peer.to_string()));
        }
        if let Frame::Data(body) = &frame {
            if body.len() > self.max_frame {
                return Err(ProtocolError::FrameTooLarge {
                    size: body.len(),
                    max: self.max_frame,
                }
                .into());
            }
        }
        self.outbound
            .send(frame)
            .map_err(|_| NodeError::NoConnection(self.peer.to_string()))
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<Pid, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an async call. Fails if the connection is already gone, so a
    /// call can never be parked on a dead connection.
    pub(crate) fn add_pending(&self, reply_to: Pid, call: PendingCall) -> Result<(), NodeError> {
        let mut pending = self.pending();
        if self.is_down() {
            return Err(NodeError::NoConnection(self.peer.to_string()));
        }
        pending.insert(reply_to, call);
        Ok(())
    }

    pub(crate) fn take_pending(&self, reply_to: &Pid) -> Option<PendingCall> {
        self.pending().remove(reply_to)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    /// Move to `Down`. Returns the previous state, or `None` if the
    /// connection was already down. Pending calls fail with `NoConnection`.
    pub(crate) fn mark_down(&self, failure: Option<DialFailure>) -> Option<ConnState> {
        let mut previous = None;
        self.state.send_if_modified(|s| {
            if matches!(s, ConnState::Down(_)) {
                return false;
            }
            previous = Some(std::mem::replace(s, ConnState::Down(failure)));
            true
        });
        if previous.is_none() {
            return None;
        }
        let _ = self.shutdown.send(());
        // Drain under the lock so add_pending sees Down afterwards
        let drained: Vec<PendingCall> = self.pending().drain().map(|(_, c)| c).collect();
        for call in drained {
            call.complete(Err(RpcError::NoConnection));
        }
        previous
    }

    /// Take over a finished handshake: start the writer, ticker and decode
    /// loop and move to `Up`.
    pub(crate) fn start<T>(
        self: &Arc<Self>,
        node: &Node,
        established: Established<T>,
    ) -> Result<(), NodeError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| NodeError::Connection(format!("{} started twice", self.peer)))?;
        let _ = self.info.set(established.info);

        let params = node.params();
        let mut parts = FramedParts::new::<Frame>(established.io, DistCodec::new(params.max_frame_bytes));
        parts.read_buf = established.read_buf;
        let (sink, stream) = Framed::from_parts(parts).split();

        // Subscribe before moving to Up so a close in between is not missed
        let writer_stop = self.shutdown.subscribe();
        let ticker_stop = self.shutdown.subscribe();
        let reader_stop = self.shutdown.subscribe();

        let moved = self.state.send_if_modified(|s| {
            if matches!(s, ConnState::Connecting) {
                *s = ConnState::Up;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(NodeError::NoConnection(self.peer.to_string()));
        }

        let weak = node.downgrade();
        tokio::spawn(write_loop(Arc::clone(self), weak.clone(), sink, queued, writer_stop));
        tokio::spawn(tick_loop(
            self.peer.clone(),
            self.outbound.clone(),
            params.tick_interval(),
            ticker_stop,
        ));
        tokio::spawn(read_loop(
            Arc::clone(self),
            weak,
            stream,
            params.net_ticktime(),
            reader_stop,
        ));
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("info", &self.info())
            .finish()
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Tear down from inside a connection task.
fn close_from_task(conn: &Arc<Connection>, node: &Weak<NodeInner>, reason: &str) {
    match Node::upgrade(node) {
        Some(node) => node.drop_connection(conn, None, reason),
        None => {
            conn.mark_down(None);
        }
    }
}

async fn write_loop<S>(
    conn: Arc<Connection>,
    node: Weak<NodeInner>,
    mut sink: S,
    mut queued: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: Sink<Frame, Error = ProtocolError> + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            frame = queued.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(peer = %conn.peer, error = %e, "dist: write failed");
                    close_from_task(&conn, &node, "write failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn tick_loop(
    peer: Atom,
    outbound: mpsc::UnboundedSender<Frame>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                if outbound.send(Frame::Tick).is_err() {
                    return;
                }
                tracing::trace!(peer = %peer, "dist: tick sent");
            }
        }
    }
}

async fn read_loop<S>(
    conn: Arc<Connection>,
    node: Weak<NodeInner>,
    mut stream: S,
    ticktime: Duration,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: Stream<Item = Result<Frame, ProtocolError>> + Unpin,
{
    let reason = loop {
        let next = tokio::select! {
            _ = shutdown.recv() => return,
            next = tokio::time::timeout(ticktime, stream.next()) => next,
        };
        match next {
            Err(_) => break format!("no traffic for {ticktime:?}"),
            Ok(None) => break "closed by peer".to_string(),
            Ok(Some(Err(e))) => break e.to_string(),
            Ok(Some(Ok(Frame::Tick))) => {
                tracing::trace!(peer = %conn.peer, "dist: tick received");
            }
            Ok(Some(Ok(Frame::Data(body)))) => match decode_message(&body) {
                Ok(msg) => match Node::upgrade(&node) {
                    Some(node) => node.dispatch(&conn, msg),
                    None => break "local node gone".to_string(),
                },
                Err(e) => {
                    tracing::warn!(
                        peer = %conn.peer,
                        error = %e,
                        len = body.len(),
                        head = %hex::encode(&body[..body.len().min(DUMP_BYTES)]),
                        "dist: skipping undecodable frame"
                    );
                }
            },
        }
    };
    tracing::info!(peer = %conn.peer, reason = %reason, "dist: connection lost");
    close_from_task(&conn, &node, &reason);
}

/// Resolve a pending async call with a reply that arrived as a plain send.
/// Returns the message back if no call was waiting for it.
pub(crate) fn resolve_pending(conn: &Connection, to: &Pid, message: Term) -> Option<Term> {
    match conn.take_pending(to) {
        Some(call) => {
            call.complete(unwrap_reply(message));
            None
        }
        None => Some(message),
    }
}
