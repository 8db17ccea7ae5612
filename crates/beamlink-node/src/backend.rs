//! Backend -- one connected peer runtime behind a single handle.
//!
//! Connecting runs the whole bring-up: wait for discovery, handshake, wait for
//! the peer's code server, apply load paths, run the configured startup call.
//! Editors and other consumers only see `call`, `cast`, `async_call`, `send`,
//! `receive_event` and `register_status_handler`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beamlink_protocol::{Atom, DistParams, FromTerm, Pid, Term};

use crate::code::CodeManager;
use crate::config::NodeConfig;
use crate::discovery::{self, RetryPolicy};
use crate::events::{self, EventDaemon, EventHandler, LogEventHandler, StatusHandler, StatusSubscription};
use crate::mailbox::{Dest, Mailbox, ReceiveError};
use crate::node::{split_node_name, Node};
use crate::rpc::{RpcClient, RpcError, RpcFuture, RpcResult};
use crate::NodeError;

pub struct Backend {
    node: Node,
    peer: Atom,
    rpc: RpcClient,
    code: CodeManager,
    events: Arc<Mailbox>,
    daemon: Mutex<Option<EventDaemon>>,
    script_id: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl Backend {
    /// Start a local node from `config` and bring up the configured peer.
    pub async fn connect(config: &NodeConfig) -> Result<Self, NodeError> {
        let cookie = config.load_cookie()?;
        let node = Node::with_params(&config.node_name(), cookie, config.params())?;
        Self::connect_with(node, config).await
    }

    /// Bring up the configured peer on an existing node.
    pub async fn connect_with(node: Node, config: &NodeConfig) -> Result<Self, NodeError> {
        let peer = Atom::from(config.peer_name());
        let params = node.params();
        tracing::debug!(peer = %peer, "backend: waiting for peer");

        let events = Arc::new(node.create_mailbox(Some(config.events.mailbox.as_str()))?);
        wait_for_peer(&node, &peer, &params).await?;

        let rpc = RpcClient::new(node.clone(), peer.clone())
            .with_timeout(config.rpc.default_timeout.as_duration());
        let code = CodeManager::new(rpc.clone());
        let backend = Self {
            node,
            peer,
            rpc,
            code,
            events,
            daemon: Mutex::new(None),
            script_id: Mutex::new(None),
            stopped: AtomicBool::new(false),
        };

        if config.code.wait_for_code_server {
            let ready = backend
                .code
                .wait_for_code_server(
                    params.code_server_poll_tries,
                    Duration::from_millis(params.code_server_poll_interval_ms),
                )
                .await;
            if !ready {
                tracing::error!(peer = %backend.peer, "backend: could not connect to backend, check the runtime settings");
            }
        }
        if let Err(e) = backend.code.apply_config(&config.code).await {
            tracing::warn!(peer = %backend.peer, error = %e, "backend: load path not added");
        }
        if let Some(initial) = &config.startup.initial_call {
            let args = initial.args.iter().map(|a| crate::parse_term_arg(a)).collect();
            tracing::debug!(module = %initial.module, function = %initial.function, "backend: calling startup function");
            if let Err(e) = backend.rpc.cast(&initial.module, &initial.function, args) {
                tracing::warn!(error = %e, "backend: startup call failed");
            }
        }
        tracing::info!(peer = %backend.peer, node = %backend.node.name(), "backend: connected");
        Ok(backend)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn peer(&self) -> &Atom {
        &self.peer
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn code(&self) -> &CodeManager {
        &self.code
    }

    pub fn event_pid(&self) -> &Pid {
        self.events.pid()
    }

    pub fn is_available(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.node.is_connected(self.peer.as_str())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub async fn call(&self, module: &str, function: &str, args: Vec<Term>) -> Result<Term, RpcError> {
        self.rpc.call(module, function, args).await
    }

    pub async fn call_timeout(
        &self,
        timeout: Option<Duration>,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Term, RpcError> {
        self.rpc.call_timeout(timeout, module, function, args).await
    }

    pub async fn call_sig(
        &self,
        module: &str,
        function: &str,
        signature: &str,
        args: Vec<Term>,
    ) -> Result<Term, RpcError> {
        self.rpc.call_sig(module, function, signature, args).await
    }

    pub async fn call_noexception(&self, module: &str, function: &str, args: Vec<Term>) -> RpcResult {
        self.rpc
            .call_noexception(self.rpc.default_timeout(), module, function, args)
            .await
    }

    pub fn cast(&self, module: &str, function: &str, args: Vec<Term>) -> Result<(), RpcError> {
        self.rpc.cast(module, function, args)
    }

    pub fn async_call(&self, module: &str, function: &str, args: Vec<Term>) -> Result<RpcFuture, RpcError> {
        self.rpc.async_call(module, function, args)
    }

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
        self.rpc.async_call_cb(callback, module, function, args)
    }

    /// Send from the event mailbox. Does nothing once the backend is gone.
    pub fn send(&self, dest: impl Into<Dest>, msg: Term) -> Result<(), NodeError> {
        if !self.is_available() {
            tracing::debug!(peer = %self.peer, "backend: not available, message dropped");
            return Ok(());
        }
        self.events.send(dest, msg)
    }

    /// Next message on the event mailbox. Not for use alongside the event
    /// daemon, which drains the same mailbox.
    pub async fn receive_event(&self, timeout: Option<Duration>) -> Result<Term, ReceiveError> {
        self.events.receive(timeout).await
    }

    /// Start dispatching events to handlers; `log` events go to the local
    /// log. Calling again keeps the running daemon.
    pub fn start_event_daemon(&self) {
        let mut daemon = self.daemon.lock().unwrap_or_else(|e| e.into_inner());
        if daemon.is_none() {
            let started = EventDaemon::start(Arc::clone(&self.events));
            started.add_handler(LogEventHandler);
            *daemon = Some(started);
        }
    }

    /// Add an event handler, starting the daemon if needed.
    pub fn add_event_handler(&self, handler: impl EventHandler + 'static) {
        self.start_event_daemon();
        if let Some(daemon) = &*self.daemon.lock().unwrap_or_else(|e| e.into_inner()) {
            daemon.add_handler(handler);
        }
    }

    pub fn register_status_handler(&self, handler: impl StatusHandler) -> StatusSubscription {
        events::register_status_handler(&self.node, handler)
    }

    /// Name part of the peer's `init:script_id/0`. Cached after the first call.
    pub async fn script_id(&self) -> Result<String, RpcError> {
        if let Some(id) = &*self.script_id.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(id.clone());
        }
        let reply = self.rpc.call("init", "script_id", vec![]).await?;
        let id = reply
            .as_tuple()
            .and_then(|t| t.get(1))
            .and_then(|v| String::from_term(v).ok())
            .unwrap_or_default();
        *self.script_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.clone());
        Ok(id)
    }

    /// Stop the event daemon and close the local node.
    pub fn dispose(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(peer = %self.peer, "backend: disposing");
        if let Some(daemon) = self.daemon.lock().unwrap_or_else(|e| e.into_inner()).take() {
            daemon.stop();
        }
        self.node.close();
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("node", self.node.name())
            .field("peer", &self.peer)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Discovery then handshake, with failures turned into one message that
/// says what to check.
async fn wait_for_peer(node: &Node, peer: &Atom, params: &DistParams) -> Result<(), NodeError> {
    let (_, host) = split_node_name(peer.as_str())
        .ok_or_else(|| NodeError::Config(format!("peer name {peer} is not of the form alive@host")))?;

    discovery::await_discovery_service(host, params.epmd_port, RetryPolicy::from_params(params))
        .await
        .map_err(|e| {
            NodeError::Connection(format!(
                "could not contact the discovery service on {host} ({e}); \
                 the peer runtime is probably not running, or the host entry for {host} is wrong"
            ))
        })?;

    node.connect(peer.as_str()).await.map_err(|e| match e {
        NodeError::Authentication(msg) => NodeError::Authentication(format!(
            "{peer} rejected the handshake ({msg}); check that both sides use the same cookie"
        )),
        other => NodeError::Connection(format!(
            "could not connect to {peer} ({other}); is the peer runtime started with that name?"
        )),
    })
}
