//! Remote calls through the peer's `rex` server.
//!
//! - call: `{ReplyPid, {call, M, F, Args, GroupLeader}}` to `rex`, reply is `{rex, Reply}`
//! - cast: `{'$gen_cast', {cast, M, F, Args, GroupLeader}}`, no reply
//! - async call: the reply pid has no mailbox; the decode loop hands the
//!   reply straight to the parked future or callback

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use beamlink_protocol::{encode_message, Atom, ControlMessage, Pid, Term, REX};

use crate::connection::{Connection, PendingCall, ReplySlot};
use crate::mailbox::{Dest, ReceiveError};
use crate::node::Node;
use crate::NodeError;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc timed out")]
    Timeout,
    #[error("no connection to peer")]
    NoConnection,
    #[error("arguments do not match signature: {0}")]
    Signature(String),
    #[error("remote error: {0}")]
    Remote(Term),
    #[error("backend error: {0}")]
    Backend(NodeError),
}

impl From<NodeError> for RpcError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::NoConnection(_) => RpcError::NoConnection,
            other => RpcError::Backend(other),
        }
    }
}

impl From<ReceiveError> for RpcError {
    fn from(e: ReceiveError) -> Self {
        match e {
            ReceiveError::Timeout => RpcError::Timeout,
            ReceiveError::Closed | ReceiveError::Exit { .. } => RpcError::NoConnection,
        }
    }
}

/// `{rex, Reply}` to `Reply`, `{rex, {badrpc, Reason}}` to a remote error.
/// Anything else is passed through as the reply.
pub(crate) fn unwrap_reply(message: Term) -> Result<Term, RpcError> {
    let reply = match message {
        Term::Tuple(mut elems) if elems.len() == 2 && elems[0].is_atom(REX) => elems.remove(1),
        other => other,
    };
    match reply {
        Term::Tuple(mut elems) if elems.len() == 2 && elems[0].is_atom("badrpc") => {
            Err(RpcError::Remote(elems.remove(1)))
        }
        other => Ok(other),
    }
}

fn is_down_for(msg: &Term, reference: &Term) -> bool {
    msg.tagged("DOWN", 5).is_some_and(|f| f[1] == *reference)
}

// ============================================================================
// Signatures
// ============================================================================

/// One argument type in a call signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    Atom,
    Integer,
    Float,
    /// Character list or UTF-8 binary.
    String,
    Binary,
    Pid,
    Ref,
    Tuple,
    List(Box<ArgType>),
    Boolean,
    Any,
}

impl ArgType {
    fn accepts(&self, term: &Term) -> bool {
        match (self, term) {
            (ArgType::Any, _) => true,
            (ArgType::Atom, Term::Atom(_)) => true,
            (ArgType::Integer, Term::Integer(_) | Term::BigInt(_)) => true,
            (ArgType::Float, Term::Float(_)) => true,
            (ArgType::String, Term::Binary(data)) => std::str::from_utf8(data).is_ok(),
            (ArgType::String, Term::List(elems)) => elems.iter().all(|e| {
                matches!(e, Term::Integer(c) if u32::try_from(*c).ok().and_then(char::from_u32).is_some())
            }),
            (ArgType::Binary, Term::Binary(_)) => true,
            (ArgType::Pid, Term::Pid(_)) => true,
            (ArgType::Ref, Term::Ref(_)) => true,
            (ArgType::Tuple, Term::Tuple(_)) => true,
            (ArgType::List(inner), Term::List(elems)) => elems.iter().all(|e| inner.accepts(e)),
            (ArgType::Boolean, t) => t.is_atom("true") || t.is_atom("false"),
            _ => false,
        }
    }
}

/// Parse a signature such as `"a i ls"`: one letter per argument, `l`
/// prefixes the element type of a list. Whitespace is ignored.
pub fn parse_signature(signature: &str) -> Result<Vec<ArgType>, RpcError> {
    let mut chars = signature.chars().filter(|c| !c.is_whitespace());
    let mut types = Vec::new();
    while let Some(c) = chars.next() {
        types.push(parse_type(c, &mut chars, signature)?);
    }
    Ok(types)
}

fn parse_type(
    c: char,
    rest: &mut impl Iterator<Item = char>,
    signature: &str,
) -> Result<ArgType, RpcError> {
    Ok(match c {
        'a' => ArgType::Atom,
        'i' => ArgType::Integer,
        'f' => ArgType::Float,
        's' => ArgType::String,
        'b' => ArgType::Binary,
        'p' => ArgType::Pid,
        'r' => ArgType::Ref,
        't' => ArgType::Tuple,
        'o' => ArgType::Boolean,
        'x' => ArgType::Any,
        'l' => {
            let inner = rest.next().ok_or_else(|| {
                RpcError::Signature(format!("{signature:?}: list type without element type"))
            })?;
            ArgType::List(Box::new(parse_type(inner, rest, signature)?))
        }
        other => {
            return Err(RpcError::Signature(format!(
                "{signature:?}: unknown type letter {other:?}"
            )))
        }
    })
}

/// Check `args` against `signature` before anything is sent.
pub fn validate_args(signature: &str, args: &[Term]) -> Result<(), RpcError> {
    let types = parse_signature(signature)?;
    if types.len() != args.len() {
        return Err(RpcError::Signature(format!(
            "{signature:?} takes {} arguments, got {}",
            types.len(),
            args.len()
        )));
    }
    for (i, (ty, arg)) in types.iter().zip(args).enumerate() {
        if !ty.accepts(arg) {
            return Err(RpcError::Signature(format!(
                "argument {} is a {}, expected {ty:?}",
                i + 1,
                arg.type_name()
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a call that follows the `{ok, R}` / `{error, R}` convention.
#[derive(Debug)]
pub enum RpcResult {
    Ok(Term),
    Error(Term),
    Failure(RpcError),
}

impl RpcResult {
    pub fn from_reply(reply: Result<Term, RpcError>) -> Self {
        match reply {
            Ok(Term::Tuple(mut elems)) if elems.len() == 2 && elems[0].is_atom("ok") => {
                RpcResult::Ok(elems.remove(1))
            }
            Ok(Term::Tuple(mut elems)) if elems.len() == 2 && elems[0].is_atom("error") => {
                RpcResult::Error(elems.remove(1))
            }
            Ok(other) => RpcResult::Ok(other),
            Err(e) => RpcResult::Failure(e),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcResult::Ok(_))
    }

    pub fn into_result(self) -> Result<Term, RpcError> {
        match self {
            RpcResult::Ok(t) => Ok(t),
            RpcResult::Error(reason) => Err(RpcError::Remote(reason)),
            RpcResult::Failure(e) => Err(e),
        }
    }
}

/// Reply to an [`RpcClient::async_call`].
pub struct RpcFuture {
    reply_to: Pid,
    rx: oneshot::Receiver<Result<Term, RpcError>>,
}

impl RpcFuture {
    pub fn reply_to(&self) -> &Pid {
        &self.reply_to
    }

    /// The result if it has arrived, without waiting.
    pub fn try_result(&mut self) -> Option<Result<Term, RpcError>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RpcError::NoConnection)),
        }
    }
}

impl Future for RpcFuture {
    type Output = Result<Term, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(RpcError::NoConnection)))
    }
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFuture")
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

// ============================================================================
// Client
// ============================================================================

/// Calls into one peer. `None` timeouts wait forever.
#[derive(Clone)]
pub struct RpcClient {
    node: Node,
    peer: Atom,
    default_timeout: Option<Duration>,
    group_leader: Term,
}

impl RpcClient {
    pub fn new(node: Node, peer: impl Into<Atom>) -> Self {
        let default_timeout = Some(Duration::from_millis(node.params().default_rpc_timeout_ms));
        Self {
            node,
            peer: peer.into(),
            default_timeout,
            group_leader: Term::atom("user"),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Where remote io output goes; `user` unless set.
    pub fn with_group_leader(mut self, group_leader: Term) -> Self {
        self.group_leader = group_leader;
        self
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn peer(&self) -> &Atom {
        &self.peer
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    fn request(&self, kind: &str, module: &str, function: &str, args: Vec<Term>, group_leader: Term) -> Term {
        Term::tuple(vec![
            Term::atom(kind),
            Term::atom(module),
            Term::atom(function),
            Term::list(args),
            group_leader,
        ])
    }

    pub async fn call(&self, module: &str, function: &str, args: Vec<Term>) -> Result<Term, RpcError> {
        self.call_with(self.default_timeout, self.group_leader.clone(), module, function, args)
            .await
    }

    pub async fn call_timeout(
        &self,
        timeout: Option<Duration>,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Term, RpcError> {
        self.call_with(timeout, self.group_leader.clone(), module, function, args)
            .await
    }

    /// Synchronous call. The reply is matched by a selective receive on a
    /// scratch mailbox that also monitors the remote `rex`, so a lost
    /// connection ends the wait at once.
    pub async fn call_with(
        &self,
        timeout: Option<Duration>,
        group_leader: Term,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Term, RpcError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let connect = self.node.connect(self.peer.as_str());
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, connect)
                .await
                .map_err(|_| RpcError::Timeout)??,
            None => connect.await?,
        }

        // Closed on drop, which also releases the monitor
        let mailbox = self.node.create_mailbox(None)?;
        let rex = Dest::remote(REX, self.peer.clone());
        let reference = Term::Ref(mailbox.monitor(rex.clone())?);

        tracing::debug!(peer = %self.peer, module, function, "rpc: call");
        let request = self.request("call", module, function, args, group_leader);
        mailbox.send(rex, Term::tuple(vec![Term::Pid(mailbox.pid().clone()), request]))?;

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let reply = mailbox
            .receive_matching(
                |m| m.tagged(REX, 2).is_some() || is_down_for(m, &reference),
                remaining,
            )
            .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(ReceiveError::Timeout) => {
                tracing::debug!(peer = %self.peer, module, function, "rpc: call timed out");
                return Err(RpcError::Timeout);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(down) = reply.tagged("DOWN", 5) {
            let reason = down[4].clone();
            return Err(if reason.is_atom("noconnection") {
                RpcError::NoConnection
            } else {
                RpcError::Remote(reason)
            });
        }
        unwrap_reply(reply)
    }

    /// [`call`](Self::call) after checking `args` against `signature`.
    pub async fn call_sig(
        &self,
        module: &str,
        function: &str,
        signature: &str,
        args: Vec<Term>,
    ) -> Result<Term, RpcError> {
        validate_args(signature, &args)?;
        self.call(module, function, args).await
    }

    /// Never fails; errors land in [`RpcResult::Failure`].
    pub async fn call_noexception(
        &self,
        timeout: Option<Duration>,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> RpcResult {
        RpcResult::from_reply(self.call_timeout(timeout, module, function, args).await)
    }

    /// Fire and forget. Returns once the request is queued; an error only
    /// means the connection is known to be down.
    pub fn cast(&self, module: &str, function: &str, args: Vec<Term>) -> Result<(), RpcError> {
        let request = self.request("cast", module, function, args, self.group_leader.clone());
        let msg = Term::tuple(vec![Term::atom("$gen_cast"), request]);
        let from = self.node.make_pid();
        tracing::debug!(peer = %self.peer, module, function, "rpc: cast");
        self.node
            .route(&from, &Dest::remote(REX, self.peer.clone()), msg)?;
        Ok(())
    }

    pub fn cast_sig(
        &self,
        module: &str,
        function: &str,
        signature: &str,
        args: Vec<Term>,
    ) -> Result<(), RpcError> {
        validate_args(signature, &args)?;
        self.cast(module, function, args)
    }

    /// Start a call and return a future for the reply.
    pub fn async_call(&self, module: &str, function: &str, args: Vec<Term>) -> Result<RpcFuture, RpcError> {
        let (tx, rx) = oneshot::channel();
        let reply_to = self.park(ReplySlot::Future(tx), module, function, args)?;
        Ok(RpcFuture { reply_to, rx })
    }

    /// Start a call whose result goes to `callback`. The callback runs on
    /// the connection's decode task, or the timer task on timeout, so it
    /// should not block.
    pub fn async_call_cb<F>(
        &self,
        callback: F,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<(), RpcError>
    where
        F: FnOnce(Result<Term, RpcError>) + Send + 'static,
    {
        self.park(ReplySlot::Callback(Box::new(callback)), module, function, args)?;
        Ok(())
    }

    fn park(
        &self,
        slot: ReplySlot,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Pid, RpcError> {
        let conn = self.node.connection_for(&self.peer)?;
        let reply_to = self.node.make_pid();
        let request = self.request("call", module, function, args, self.group_leader.clone());
        let frame = encode_message(&ControlMessage::RegSend {
            from: reply_to.clone(),
            to_name: Atom::from(REX),
            message: Term::tuple(vec![Term::Pid(reply_to.clone()), request]),
        })
        .map_err(NodeError::from)?;

        conn.add_pending(reply_to.clone(), PendingCall::new(slot))?;
        if let Err(e) = conn.enqueue(frame) {
            conn.take_pending(&reply_to);
            return Err(e.into());
        }
        if let Some(timeout) = self.default_timeout {
            tokio::spawn(expire(Arc::downgrade(&conn), reply_to.clone(), timeout));
        }
        tracing::debug!(peer = %self.peer, module, function, reply_to = %reply_to, "rpc: async call");
        Ok(reply_to)
    }
}

async fn expire(conn: std::sync::Weak<Connection>, reply_to: Pid, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(conn) = conn.upgrade() else {
        return;
    };
    if let Some(call) = conn.take_pending(&reply_to) {
        tracing::debug!(peer = %conn.peer(), reply_to = %reply_to, "rpc: async call timed out");
        call.complete(Err(RpcError::Timeout));
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
