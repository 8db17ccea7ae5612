//! The local node -- identity, mailbox registry, connection table, and the
//! handling of control messages arriving from peers.
//!
//! Lock order: registry before any mailbox; never two mailboxes at once.
//! No lock is held while a signal is routed onward.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use beamlink_crypto::Cookie;
use beamlink_protocol::{
    encode_message, flags, Atom, ControlMessage, DistParams, Pid, Reference, Target, Term,
    DEFAULT_PARAMS,
};

use crate::connection::{resolve_pending, ConnState, Connection, DialFailure};
use crate::handshake::{self, ConnectionInfo, Established, LocalIdentity};
use crate::mailbox::{down_message, Dest, Mailbox, MailboxShared, MonitorTarget};
use crate::{discovery, NodeError};

/// Buffered status events per subscriber.
const STATUS_CAPACITY: usize = 64;

/// A peer connection came up or went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub peer: Atom,
    pub up: bool,
}

/// Split `alive@host`.
pub fn split_node_name(name: &str) -> Option<(&str, &str)> {
    let (alive, host) = name.split_once('@')?;
    if alive.is_empty() || host.is_empty() || host.contains('@') {
        return None;
    }
    Some((alive, host))
}

#[derive(Default)]
struct Registry {
    by_pid: HashMap<Pid, Arc<MailboxShared>>,
    by_name: HashMap<Atom, Pid>,
}

pub(crate) struct NodeInner {
    name: Atom,
    creation: u32,
    flags: u64,
    cookie: Cookie,
    params: DistParams,
    next_pid: AtomicU64,
    next_ref: AtomicU64,
    registry: Mutex<Registry>,
    connections: RwLock<HashMap<Atom, Arc<Connection>>>,
    /// Taken on close so subscribers see the channel end.
    status: Mutex<Option<broadcast::Sender<StatusEvent>>>,
    closed: AtomicBool,
}

/// Handle to the local node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(name: &str, cookie: Cookie) -> Result<Self, NodeError> {
        Self::with_params(name, cookie, DEFAULT_PARAMS)
    }

    pub fn with_params(name: &str, cookie: Cookie, params: DistParams) -> Result<Self, NodeError> {
        if split_node_name(name).is_none() {
            return Err(NodeError::Config(format!(
                "node name {name:?} is not of the form alive@host"
            )));
        }
        if name.chars().count() > 255 {
            return Err(NodeError::Config(format!("node name {name:?} is too long")));
        }
        if params.net_ticktime_secs == 0 {
            return Err(NodeError::Config("net_ticktime_secs must be at least 1".into()));
        }
        let creation = rand::thread_rng().gen_range(1..=u32::MAX);
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        tracing::info!(node = name, creation, "node: started");
        Ok(Self {
            inner: Arc::new(NodeInner {
                name: Atom::from(name),
                creation,
                flags: flags::DEFAULT_FLAGS,
                cookie,
                params,
                next_pid: AtomicU64::new(1),
                next_ref: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
                connections: RwLock::new(HashMap::new()),
                status: Mutex::new(Some(status)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &Atom {
        &self.inner.name
    }

    pub fn creation(&self) -> u32 {
        self.inner.creation
    }

    pub fn params(&self) -> DistParams {
        self.inner.params
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<NodeInner>) -> Option<Node> {
        weak.upgrade().map(|inner| Node { inner })
    }

    fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            name: self.inner.name.clone(),
            flags: self.inner.flags,
            creation: self.inner.creation,
            cookie: self.inner.cookie.clone(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connections(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Atom, Arc<Connection>>> {
        self.inner.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn connections_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Atom, Arc<Connection>>> {
        self.inner.connections.write().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Identifiers
    // ========================================================================

    /// Fresh pid on this node. Ids use the classic 15-bit id / 13-bit serial
    /// split so any peer can hold them.
    pub fn make_pid(&self) -> Pid {
        let n = self.inner.next_pid.fetch_add(1, Ordering::Relaxed);
        Pid::new(
            self.inner.name.clone(),
            (n & 0x7fff) as u32,
            ((n >> 15) & 0x1fff) as u32,
            self.inner.creation,
        )
    }

    pub fn make_ref(&self) -> Reference {
        let n = self.inner.next_ref.fetch_add(1, Ordering::Relaxed);
        Reference {
            node: self.inner.name.clone(),
            ids: vec![(n & 0x3ffff) as u32, (n >> 18) as u32, rand::random::<u32>()],
            creation: self.inner.creation,
        }
    }

    pub fn is_local(&self, pid: &Pid) -> bool {
        pid.node == self.inner.name
    }

    // ========================================================================
    // Mailboxes
    // ========================================================================

    /// Create a mailbox, optionally registered under `name`.
    pub fn create_mailbox(&self, name: Option<&str>) -> Result<Mailbox, NodeError> {
        if self.is_closed() {
            return Err(NodeError::Config("node is closed".into()));
        }
        let pid = self.make_pid();
        let name = name.map(Atom::from);
        let shared = Arc::new(MailboxShared::new(pid.clone(), name.clone()));
        {
            let mut reg = self.registry();
            if let Some(name) = &name {
                if reg.by_name.contains_key(name) {
                    return Err(NodeError::NameTaken(name.to_string()));
                }
                reg.by_name.insert(name.clone(), pid.clone());
            }
            reg.by_pid.insert(pid.clone(), Arc::clone(&shared));
        }
        tracing::debug!(pid = %pid, name = ?name.as_ref().map(|n| n.as_str()), "mailbox: created");
        Ok(Mailbox::new(shared, self.clone()))
    }

    pub fn whereis(&self, name: &str) -> Option<Pid> {
        self.registry().by_name.get(&Atom::from(name)).cloned()
    }

    pub fn registered(&self) -> Vec<Atom> {
        let mut names: Vec<Atom> = self.registry().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn mailbox_count(&self) -> usize {
        self.registry().by_pid.len()
    }

    fn lookup_pid(&self, pid: &Pid) -> Option<Arc<MailboxShared>> {
        self.registry().by_pid.get(pid).cloned()
    }

    fn lookup_name(&self, name: &Atom) -> Option<Arc<MailboxShared>> {
        let reg = self.registry();
        reg.by_name.get(name).and_then(|pid| reg.by_pid.get(pid)).cloned()
    }

    fn lookup_target(&self, target: &Target) -> Option<Arc<MailboxShared>> {
        match target {
            Target::Pid(pid) => self.lookup_pid(pid),
            Target::Name(name) => self.lookup_name(name),
        }
    }

    fn local_mailboxes(&self) -> Vec<Arc<MailboxShared>> {
        self.registry().by_pid.values().cloned().collect()
    }

    pub(crate) fn register(&self, me: &Arc<MailboxShared>, name: Atom) -> Result<(), NodeError> {
        let mut reg = self.registry();
        match reg.by_name.get(&name) {
            Some(owner) if *owner == me.pid => return Ok(()),
            Some(_) => return Err(NodeError::NameTaken(name.to_string())),
            None => {}
        }
        let previous = {
            let mut st = me.lock();
            if st.closed {
                return Err(NodeError::Config(format!("{} is closed", me.pid)));
            }
            st.name.replace(name.clone())
        };
        if let Some(previous) = previous {
            reg.by_name.remove(&previous);
        }
        reg.by_name.insert(name, me.pid.clone());
        Ok(())
    }

    fn unregister(&self, me: &MailboxShared) {
        let name = me.name();
        let mut reg = self.registry();
        reg.by_pid.remove(&me.pid);
        if let Some(name) = name {
            if reg.by_name.get(&name) == Some(&me.pid) {
                reg.by_name.remove(&name);
            }
        }
    }

    fn deliver_local(&self, pid: &Pid, msg: Term) {
        match self.lookup_pid(pid) {
            Some(mb) if mb.push(msg) => {}
            _ => tracing::debug!(to = %pid, "mailbox: dropping message for unknown pid"),
        }
    }

    fn deliver_named(&self, name: &Atom, msg: Term) {
        match self.lookup_name(name) {
            Some(mb) if mb.push(msg) => {}
            _ => tracing::debug!(to = %name, "mailbox: dropping message for unregistered name"),
        }
    }

    /// Route a message from `from` to `dest`.
    pub(crate) fn route(&self, from: &Pid, dest: &Dest, msg: Term) -> Result<(), NodeError> {
        match dest {
            Dest::Pid(pid) if self.is_local(pid) => {
                self.deliver_local(pid, msg);
                Ok(())
            }
            Dest::Pid(pid) => self.send_control(
                &pid.node,
                ControlMessage::Send {
                    to: pid.clone(),
                    message: msg,
                },
            ),
            Dest::Name(name) => {
                self.deliver_named(name, msg);
                Ok(())
            }
            Dest::Remote { name, node } if *node == self.inner.name => {
                self.deliver_named(name, msg);
                Ok(())
            }
            Dest::Remote { name, node } => self.send_control(
                node,
                ControlMessage::RegSend {
                    from: from.clone(),
                    to_name: name.clone(),
                    message: msg,
                },
            ),
        }
    }

    // ========================================================================
    // Links, monitors and exits
    // ========================================================================

    pub(crate) fn link(&self, me: &Arc<MailboxShared>, pid: &Pid) -> Result<(), NodeError> {
        if *pid == me.pid {
            return Ok(());
        }
        if self.is_local(pid) {
            let linked = match self.lookup_pid(pid) {
                Some(other) => {
                    let mut st = other.lock();
                    if st.closed {
                        false
                    } else {
                        st.links.insert(me.pid.clone());
                        true
                    }
                }
                None => false,
            };
            if linked {
                me.lock().links.insert(pid.clone());
            } else {
                self.terminate(me, Term::atom("noproc"), Some(pid.clone()));
            }
            return Ok(());
        }
        me.lock().links.insert(pid.clone());
        let res = self.send_control(
            &pid.node,
            ControlMessage::Link {
                from: me.pid.clone(),
                to: pid.clone(),
            },
        );
        if res.is_err() {
            me.lock().links.remove(pid);
        }
        res
    }

    pub(crate) fn unlink(&self, me: &Arc<MailboxShared>, pid: &Pid) -> Result<(), NodeError> {
        me.lock().links.remove(pid);
        if self.is_local(pid) {
            if let Some(other) = self.lookup_pid(pid) {
                other.lock().links.remove(&me.pid);
            }
            return Ok(());
        }
        let msg = if self.peer_flags(&pid.node) & flags::UNLINK_ID != 0 {
            ControlMessage::UnlinkId {
                id: rand::thread_rng().gen_range(1..=u64::MAX),
                from: me.pid.clone(),
                to: pid.clone(),
            }
        } else {
            ControlMessage::Unlink {
                from: me.pid.clone(),
                to: pid.clone(),
            }
        };
        self.send_control(&pid.node, msg)
    }

    pub(crate) fn monitor(&self, me: &Arc<MailboxShared>, dest: Dest) -> Result<Reference, NodeError> {
        let reference = self.make_ref();
        let target = match dest {
            Dest::Pid(pid) => MonitorTarget::Pid(pid),
            Dest::Name(name) => MonitorTarget::Name {
                name,
                node: self.inner.name.clone(),
            },
            Dest::Remote { name, node } => MonitorTarget::Name { name, node },
        };
        me.lock().monitors.insert(reference.clone(), target.clone());

        if *target.node() == self.inner.name {
            let wire_target = match &target {
                MonitorTarget::Pid(pid) => Target::Pid(pid.clone()),
                MonitorTarget::Name { name, .. } => Target::Name(name.clone()),
            };
            let watched = match self.lookup_target(&wire_target) {
                Some(mb) => {
                    let mut st = mb.lock();
                    if st.closed {
                        false
                    } else {
                        st.monitored_by
                            .insert(reference.clone(), (me.pid.clone(), wire_target));
                        true
                    }
                }
                None => false,
            };
            if !watched {
                self.deliver_down(&me.pid, reference.clone(), Term::atom("noproc"));
            }
            return Ok(reference);
        }

        let (peer, to) = match &target {
            MonitorTarget::Pid(pid) => (pid.node.clone(), Target::Pid(pid.clone())),
            MonitorTarget::Name { name, node } => (node.clone(), Target::Name(name.clone())),
        };
        let sent = self.send_control(
            &peer,
            ControlMessage::MonitorP {
                from: me.pid.clone(),
                to,
                reference: reference.clone(),
            },
        );
        if let Err(e) = sent {
            tracing::debug!(peer = %peer, error = %e, "monitor: peer unreachable");
            self.deliver_down(&me.pid, reference.clone(), Term::atom("noconnection"));
        }
        Ok(reference)
    }

    pub(crate) fn demonitor(&self, me: &Arc<MailboxShared>, reference: &Reference) -> Result<(), NodeError> {
        let target = me.lock().monitors.remove(reference);
        if let Some(target) = target {
            self.release_monitor(&me.pid, reference.clone(), &target);
        }
        Ok(())
    }

    fn release_monitor(&self, watcher: &Pid, reference: Reference, target: &MonitorTarget) {
        let wire_target = match target {
            MonitorTarget::Pid(pid) => Target::Pid(pid.clone()),
            MonitorTarget::Name { name, .. } => Target::Name(name.clone()),
        };
        if *target.node() == self.inner.name {
            if let Some(mb) = self.lookup_target(&wire_target) {
                mb.lock().monitored_by.remove(&reference);
            }
            return;
        }
        self.send_quiet(
            target.node(),
            ControlMessage::DemonitorP {
                from: watcher.clone(),
                to: wire_target,
                reference,
            },
        );
    }

    /// Turn a monitor held by `watcher` into a `'DOWN'` message.
    fn deliver_down(&self, watcher: &Pid, reference: Reference, reason: Term) {
        let Some(mb) = self.lookup_pid(watcher) else {
            return;
        };
        let target = mb.lock().monitors.remove(&reference);
        match target {
            Some(target) => {
                mb.push(down_message(reference, &target, reason));
            }
            None => tracing::trace!(watcher = %watcher, reference = %reference, "monitor: stale down"),
        }
    }

    /// Exit signal over a link. Ignored if no link exists; `normal` only
    /// removes the link.
    fn link_exit(&self, to: &Pid, from: &Pid, reason: Term) {
        let Some(mb) = self.lookup_pid(to) else {
            return;
        };
        let was_linked = mb.lock().links.remove(from);
        if was_linked && !reason.is_atom("normal") {
            self.terminate(&mb, reason, Some(from.clone()));
        }
    }

    /// Exit signal sent directly, linked or not.
    fn exit2(&self, to: &Pid, from: &Pid, reason: Term) {
        let Some(mb) = self.lookup_pid(to) else {
            return;
        };
        if reason.is_atom("normal") {
            return;
        }
        let reason = if reason.is_atom("kill") {
            Term::atom("killed")
        } else {
            reason
        };
        self.terminate(&mb, reason, Some(from.clone()));
    }

    /// Close a mailbox with `reason`. `from` is the process whose exit
    /// signal caused it; receivers then see `ReceiveError::Exit`.
    pub(crate) fn terminate(&self, me: &Arc<MailboxShared>, reason: Term, from: Option<Pid>) {
        let (links, monitored_by, monitors) = {
            let mut st = me.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.queue.clear();
            if let Some(from) = from {
                st.exit = Some((from, reason.clone()));
            }
            (
                std::mem::take(&mut st.links),
                std::mem::take(&mut st.monitored_by),
                std::mem::take(&mut st.monitors),
            )
        };
        me.wake();
        self.unregister(me);
        tracing::debug!(pid = %me.pid, reason = %reason, "mailbox: closed");

        for pid in links {
            if self.is_local(&pid) {
                self.link_exit(&pid, &me.pid, reason.clone());
            } else {
                self.send_quiet(
                    &pid.node.clone(),
                    ControlMessage::Exit {
                        from: me.pid.clone(),
                        to: pid,
                        reason: reason.clone(),
                    },
                );
            }
        }
        for (reference, (watcher, target)) in monitored_by {
            if self.is_local(&watcher) {
                self.deliver_down(&watcher, reference, reason.clone());
            } else {
                self.send_quiet(
                    &watcher.node.clone(),
                    ControlMessage::MonitorPExit {
                        from: target,
                        to: watcher,
                        reference,
                        reason: reason.clone(),
                    },
                );
            }
        }
        for (reference, target) in monitors {
            self.release_monitor(&me.pid, reference, &target);
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to `peer` (`alive@host`) and wait for the handshake.
    pub async fn connect(&self, peer: &str) -> Result<(), NodeError> {
        let conn = self.connection_for(&Atom::from(peer))?;
        conn.wait_up().await
    }

    /// True if `peer` is reachable and accepts our cookie.
    pub async fn ping(&self, peer: &str) -> bool {
        self.connect(peer).await.is_ok()
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.connections()
            .get(&Atom::from(peer))
            .is_some_and(|c| c.is_up())
    }

    /// Peers with a live connection.
    pub fn peers(&self) -> Vec<Atom> {
        let mut peers: Vec<Atom> = self
            .connections()
            .values()
            .filter(|c| c.is_up())
            .map(|c| c.peer().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection_info(&self, peer: &str) -> Option<ConnectionInfo> {
        self.connections()
            .get(&Atom::from(peer))
            .and_then(|c| c.info().cloned())
    }

    /// Async calls to `peer` still waiting for a reply.
    pub fn pending_calls(&self, peer: &str) -> usize {
        self.connections()
            .get(&Atom::from(peer))
            .map_or(0, |c| c.pending_calls())
    }

    fn peer_flags(&self, peer: &Atom) -> u64 {
        self.connections()
            .get(peer)
            .and_then(|c| c.info().map(|i| i.flags))
            .unwrap_or(0)
    }

    /// Connection up/down events. The channel ends when the node closes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        match &*self.status_sender() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn status_sender(&self) -> MutexGuard<'_, Option<broadcast::Sender<StatusEvent>>> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn publish_status(&self, peer: &Atom, up: bool) {
        if let Some(tx) = &*self.status_sender() {
            let _ = tx.send(StatusEvent {
                peer: peer.clone(),
                up,
            });
        }
    }

    pub fn disconnect(&self, peer: &str) {
        let conn = self.connections().get(&Atom::from(peer)).cloned();
        if let Some(conn) = conn {
            self.drop_connection(&conn, None, "disconnected locally");
        }
    }

    /// Close every connection and mailbox. Further sends fail.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns: Vec<Arc<Connection>> = self.connections().values().cloned().collect();
        for conn in conns {
            self.drop_connection(&conn, None, "local node closed");
        }
        for mb in self.local_mailboxes() {
            self.terminate(&mb, Term::atom("normal"), None);
        }
        self.status_sender().take();
        tracing::info!(node = %self.inner.name, "node: closed");
    }

    /// The connection to `peer`, dialling if there is none. Concurrent
    /// callers share one dial.
    pub(crate) fn connection_for(&self, peer: &Atom) -> Result<Arc<Connection>, NodeError> {
        if self.is_closed() {
            return Err(NodeError::NoConnection(peer.to_string()));
        }
        if *peer == self.inner.name {
            return Err(NodeError::Connection("cannot connect to ourselves".into()));
        }
        if let Some(conn) = self.connections().get(peer) {
            if !conn.is_down() {
                return Ok(Arc::clone(conn));
            }
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| NodeError::Connection(format!("no async runtime to dial {peer}")))?;
        let conn = {
            let mut table = self.connections_mut();
            if let Some(conn) = table.get(peer) {
                if !conn.is_down() {
                    return Ok(Arc::clone(conn));
                }
            }
            let conn = Arc::new(Connection::with_max_frame(
                peer.clone(),
                self.inner.params.max_frame_bytes,
            ));
            table.insert(peer.clone(), Arc::clone(&conn));
            conn
        };
        tracing::debug!(peer = %peer, "dist: dialling");
        handle.spawn(self.clone().dial(Arc::clone(&conn)));
        Ok(conn)
    }

    async fn dial(self, conn: Arc<Connection>) {
        let res = match self.establish(conn.peer()).await {
            Ok(established) => conn.start(&self, established),
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => {
                tracing::info!(
                    peer = %conn.peer(),
                    version = conn.info().map(|i| i.version),
                    "dist: connection up"
                );
                self.publish_status(conn.peer(), true);
            }
            Err(e) => {
                tracing::warn!(peer = %conn.peer(), error = %e, "dist: dial failed");
                self.drop_connection(&conn, Some(DialFailure::from_error(&e)), "dial failed");
            }
        }
    }

    async fn establish(&self, peer: &Atom) -> Result<Established<TcpStream>, NodeError> {
        let (alive, host) = split_node_name(peer.as_str()).ok_or_else(|| {
            NodeError::Connection(format!("peer name {peer} is not of the form alive@host"))
        })?;
        let params = self.inner.params;
        let addr = discovery::resolve(host, params.epmd_port, alive).await?;
        let stream = tokio::time::timeout(
            params.connect_timeout(),
            TcpStream::connect((host, addr.port)),
        )
        .await
        .map_err(|_| NodeError::Timeout(format!("connecting to {peer} at {host}:{}", addr.port)))??;
        stream.set_nodelay(true)?;
        handshake::connect(
            stream,
            &self.identity(),
            peer,
            (addr.lowest_version, addr.highest_version),
            params.handshake_timeout(),
        )
        .await
    }

    /// Close `conn` and run the cascade for everything that referenced it.
    pub(crate) fn drop_connection(
        &self,
        conn: &Arc<Connection>,
        failure: Option<DialFailure>,
        reason: &str,
    ) {
        let Some(previous) = conn.mark_down(failure) else {
            return;
        };
        {
            let mut table = self.connections_mut();
            if table.get(conn.peer()).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                table.remove(conn.peer());
            }
        }
        self.connection_lost(conn.peer());
        if previous == ConnState::Up {
            tracing::info!(peer = %conn.peer(), reason, "dist: connection down");
            self.publish_status(conn.peer(), false);
        }
    }

    /// Links to `peer` deliver `noconnection` exits and monitors of its
    /// processes deliver `'DOWN'` messages.
    fn connection_lost(&self, peer: &Atom) {
        let reason = Term::atom("noconnection");
        for mb in self.local_mailboxes() {
            let (links, downs) = {
                let mut st = mb.lock();
                let links: Vec<Pid> = st.links.iter().filter(|p| p.node == *peer).cloned().collect();
                for pid in &links {
                    st.links.remove(pid);
                }
                let refs: Vec<Reference> = st
                    .monitors
                    .iter()
                    .filter(|(_, t)| t.node() == peer)
                    .map(|(r, _)| r.clone())
                    .collect();
                let downs: Vec<(Reference, MonitorTarget)> = refs
                    .into_iter()
                    .filter_map(|r| st.monitors.remove(&r).map(|t| (r, t)))
                    .collect();
                st.monitored_by.retain(|_, (watcher, _)| watcher.node != *peer);
                (links, downs)
            };
            for (reference, target) in downs {
                mb.push(down_message(reference, &target, reason.clone()));
            }
            if let Some(first) = links.into_iter().next() {
                self.terminate(&mb, reason.clone(), Some(first));
            }
        }
    }

    pub(crate) fn send_control(&self, peer: &Atom, msg: ControlMessage) -> Result<(), NodeError> {
        let frame = encode_message(&msg)?;
        self.connection_for(peer)?.enqueue(frame)
    }

    /// Best-effort signal; the peer may already be gone.
    fn send_quiet(&self, peer: &Atom, msg: ControlMessage) {
        if let Err(e) = self.send_control(peer, msg) {
            tracing::debug!(peer = %peer, error = %e, "dist: signal not sent");
        }
    }

    /// Reply on the connection a control message came in on.
    fn reply_on(&self, conn: &Connection, msg: ControlMessage) {
        let res = encode_message(&msg)
            .map_err(NodeError::from)
            .and_then(|frame| conn.enqueue(frame));
        if let Err(e) = res {
            tracing::debug!(peer = %conn.peer(), error = %e, "dist: reply not sent");
        }
    }

    // ========================================================================
    // Incoming control messages
    // ========================================================================

    pub(crate) fn dispatch(&self, conn: &Arc<Connection>, msg: ControlMessage) {
        tracing::trace!(peer = %conn.peer(), op = msg.op(), "dist: control message");
        match msg {
            ControlMessage::Send { to, message } | ControlMessage::SendSender { to, message, .. } => {
                if let Some(message) = resolve_pending(conn, &to, message) {
                    self.deliver_local(&to, message);
                }
            }
            ControlMessage::RegSend {
                to_name, message, ..
            } => self.deliver_named(&to_name, message),
            ControlMessage::Link { from, to } => {
                let linked = match self.lookup_pid(&to) {
                    Some(mb) => {
                        let mut st = mb.lock();
                        if st.closed {
                            false
                        } else {
                            st.links.insert(from.clone());
                            true
                        }
                    }
                    None => false,
                };
                if !linked {
                    self.reply_on(
                        conn,
                        ControlMessage::Exit {
                            from: to,
                            to: from,
                            reason: Term::atom("noproc"),
                        },
                    );
                }
            }
            ControlMessage::Unlink { from, to } => {
                if let Some(mb) = self.lookup_pid(&to) {
                    mb.lock().links.remove(&from);
                }
            }
            ControlMessage::UnlinkId { id, from, to } => {
                if let Some(mb) = self.lookup_pid(&to) {
                    mb.lock().links.remove(&from);
                }
                self.reply_on(conn, ControlMessage::UnlinkIdAck { id, from: to, to: from });
            }
            ControlMessage::UnlinkIdAck { id, .. } => {
                tracing::trace!(peer = %conn.peer(), id, "dist: unlink acknowledged");
            }
            ControlMessage::Exit { from, to, reason } => self.link_exit(&to, &from, reason),
            ControlMessage::Exit2 { from, to, reason } => self.exit2(&to, &from, reason),
            ControlMessage::MonitorP {
                from,
                to,
                reference,
            } => {
                let watched = match self.lookup_target(&to) {
                    Some(mb) => {
                        let mut st = mb.lock();
                        if st.closed {
                            false
                        } else {
                            st.monitored_by
                                .insert(reference.clone(), (from.clone(), to.clone()));
                            true
                        }
                    }
                    None => false,
                };
                if !watched {
                    self.reply_on(
                        conn,
                        ControlMessage::MonitorPExit {
                            from: to,
                            to: from,
                            reference,
                            reason: Term::atom("noproc"),
                        },
                    );
                }
            }
            ControlMessage::DemonitorP { to, reference, .. } => {
                if let Some(mb) = self.lookup_target(&to) {
                    mb.lock().monitored_by.remove(&reference);
                }
            }
            ControlMessage::MonitorPExit {
                to,
                reference,
                reason,
                ..
            } => self.deliver_down(&to, reference, reason),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("creation", &self.inner.creation)
            .finish()
    }
}
