//! Mailboxes -- process-like endpoints on the local node.
//!
//! A mailbox has a pid, an optional registered name, a FIFO queue, links and
//! monitors. Everything except receiving is non-suspending: outbound signals
//! are queued on the peer connection and local ones are applied in place.
//! Dropping the handle closes the mailbox.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use beamlink_protocol::{Atom, Pid, Reference, Target, Term};

use crate::node::Node;
use crate::NodeError;

/// Where a message or monitor goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dest {
    Pid(Pid),
    /// Registered name on the local node.
    Name(Atom),
    /// Registered name on another node.
    Remote { name: Atom, node: Atom },
}

impl Dest {
    pub fn remote(name: impl Into<Atom>, node: impl Into<Atom>) -> Self {
        Dest::Remote {
            name: name.into(),
            node: node.into(),
        }
    }
}

impl From<Pid> for Dest {
    fn from(p: Pid) -> Self {
        Dest::Pid(p)
    }
}

impl From<&Pid> for Dest {
    fn from(p: &Pid) -> Self {
        Dest::Pid(p.clone())
    }
}

impl From<Atom> for Dest {
    fn from(a: Atom) -> Self {
        Dest::Name(a)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReceiveError {
    #[error("receive timed out")]
    Timeout,
    #[error("mailbox closed")]
    Closed,
    /// A linked process exited abnormally; the mailbox is gone.
    #[error("exit signal from {from}: {reason}")]
    Exit { from: Pid, reason: Term },
}

/// The object named in a `'DOWN'` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MonitorTarget {
    Pid(Pid),
    Name { name: Atom, node: Atom },
}

impl MonitorTarget {
    pub(crate) fn node(&self) -> &Atom {
        match self {
            MonitorTarget::Pid(p) => &p.node,
            MonitorTarget::Name { node, .. } => node,
        }
    }

    pub(crate) fn to_term(&self) -> Term {
        match self {
            MonitorTarget::Pid(p) => Term::Pid(p.clone()),
            MonitorTarget::Name { name, node } => {
                Term::tuple(vec![Term::Atom(name.clone()), Term::Atom(node.clone())])
            }
        }
    }
}

/// `{'DOWN', Ref, process, Object, Reason}`
pub(crate) fn down_message(reference: Reference, target: &MonitorTarget, reason: Term) -> Term {
    Term::tuple(vec![
        Term::atom("DOWN"),
        Term::Ref(reference),
        Term::atom("process"),
        target.to_term(),
        reason,
    ])
}

#[derive(Default)]
pub(crate) struct MailboxState {
    pub(crate) queue: VecDeque<Term>,
    pub(crate) closed: bool,
    pub(crate) exit: Option<(Pid, Term)>,
    pub(crate) name: Option<Atom>,
    pub(crate) links: HashSet<Pid>,
    /// Monitors this mailbox holds.
    pub(crate) monitors: HashMap<Reference, MonitorTarget>,
    /// Processes monitoring this mailbox, with the target they named.
    pub(crate) monitored_by: HashMap<Reference, (Pid, Target)>,
}

/// The part of a mailbox the node registry shares with the handle.
pub(crate) struct MailboxShared {
    pub(crate) pid: Pid,
    state: Mutex<MailboxState>,
    notify: Notify,
}

impl MailboxShared {
    pub(crate) fn new(pid: Pid, name: Option<Atom>) -> Self {
        Self {
            pid,
            state: Mutex::new(MailboxState {
                name,
                ..MailboxState::default()
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MailboxState> {
        // State stays consistent across a panic in a receiver's predicate
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a message. Returns false if the mailbox is closed.
    pub(crate) fn push(&self, msg: Term) -> bool {
        {
            let mut st = self.lock();
            if st.closed {
                return false;
            }
            st.queue.push_back(msg);
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn name(&self) -> Option<Atom> {
        self.lock().name.clone()
    }

    pub(crate) async fn receive_matching<F>(
        &self,
        mut pred: F,
        timeout: Option<Duration>,
    ) -> Result<Term, ReceiveError>
    where
        F: FnMut(&Term) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and wait is seen
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some((from, reason)) = &st.exit {
                    return Err(ReceiveError::Exit {
                        from: from.clone(),
                        reason: reason.clone(),
                    });
                }
                if st.closed {
                    return Err(ReceiveError::Closed);
                }
                if let Some(pos) = st.queue.iter().position(&mut pred) {
                    if let Some(msg) = st.queue.remove(pos) {
                        return Ok(msg);
                    }
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut())
                        .await
                        .is_err()
                    {
                        return Err(ReceiveError::Timeout);
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }
}

/// Handle to a mailbox on the local node.
pub struct Mailbox {
    shared: Arc<MailboxShared>,
    node: Node,
}

impl Mailbox {
    pub(crate) fn new(shared: Arc<MailboxShared>, node: Node) -> Self {
        Self { shared, node }
    }

    pub fn pid(&self) -> &Pid {
        &self.shared.pid
    }

    pub fn name(&self) -> Option<Atom> {
        self.shared.name()
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Send `msg` from this mailbox. Messages to unreachable or dead
    /// processes are dropped; an error means the connection is known down.
    pub fn send(&self, dest: impl Into<Dest>, msg: Term) -> Result<(), NodeError> {
        self.node.route(&self.shared.pid, &dest.into(), msg)
    }

    /// Next message in arrival order. `None` waits forever.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Term, ReceiveError> {
        self.shared.receive_matching(|_| true, timeout).await
    }

    /// First queued message matching `pred`; others stay queued in order.
    pub async fn receive_matching<F>(
        &self,
        pred: F,
        timeout: Option<Duration>,
    ) -> Result<Term, ReceiveError>
    where
        F: FnMut(&Term) -> bool,
    {
        self.shared.receive_matching(pred, timeout).await
    }

    /// Link to `pid`. If the process does not exist this mailbox receives a
    /// `noproc` exit signal.
    pub fn link(&self, pid: &Pid) -> Result<(), NodeError> {
        self.node.link(&self.shared, pid)
    }

    pub fn unlink(&self, pid: &Pid) -> Result<(), NodeError> {
        self.node.unlink(&self.shared, pid)
    }

    /// Monitor a process by pid or name. Its exit arrives as a `'DOWN'`
    /// message carrying the returned reference.
    pub fn monitor(&self, target: impl Into<Dest>) -> Result<Reference, NodeError> {
        self.node.monitor(&self.shared, target.into())
    }

    pub fn demonitor(&self, reference: &Reference) -> Result<(), NodeError> {
        self.node.demonitor(&self.shared, reference)
    }

    /// Register a name for this mailbox on the local node.
    pub fn register(&self, name: impl Into<Atom>) -> Result<(), NodeError> {
        self.node.register(&self.shared, name.into())
    }

    /// Close with reason `normal`. Blocked receivers wake with `Closed`.
    pub fn close(&self) {
        self.node.terminate(&self.shared, Term::atom("normal"), None);
    }

    /// Terminate with `reason`; links see the exit signal and monitors a
    /// `'DOWN'` message.
    pub fn exit(&self, reason: Term) {
        self.node.terminate(&self.shared, reason, None);
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pid", &self.shared.pid)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> MailboxShared {
        MailboxShared::new(Pid::new("tool@localhost", 1, 0, 1), None)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mb = shared();
        for i in 0..5 {
            assert!(mb.push(Term::from(i)));
        }
        for i in 0..5 {
            assert_eq!(mb.receive_matching(|_| true, None).await.unwrap(), Term::from(i));
        }
    }

    #[tokio::test]
    async fn test_selective_receive_keeps_order_of_rest() {
        let mb = shared();
        mb.push(Term::atom("a"));
        mb.push(Term::tuple(vec![Term::atom("rex"), Term::from(1)]));
        mb.push(Term::atom("b"));
        let got = mb
            .receive_matching(|m| m.tagged("rex", 2).is_some(), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got.as_tuple().unwrap()[1], Term::from(1));
        assert_eq!(mb.receive_matching(|_| true, None).await.unwrap(), Term::atom("a"));
        assert_eq!(mb.receive_matching(|_| true, None).await.unwrap(), Term::atom("b"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mb = shared();
        let start = Instant::now();
        let res = mb
            .receive_matching(|_| true, Some(Duration::from_millis(30)))
            .await;
        assert_eq!(res, Err(ReceiveError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let mb = Arc::new(shared());
        let waiter = {
            let mb = mb.clone();
            tokio::spawn(async move { mb.receive_matching(|_| true, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mb.push(Term::atom("hello"));
        assert_eq!(waiter.await.unwrap().unwrap(), Term::atom("hello"));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let mb = Arc::new(shared());
        let waiter = {
            let mb = mb.clone();
            tokio::spawn(async move { mb.receive_matching(|_| true, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mb.lock().closed = true;
        mb.wake();
        assert_eq!(waiter.await.unwrap(), Err(ReceiveError::Closed));
        assert!(!mb.push(Term::atom("late")));
    }

    #[test]
    fn test_down_message_shape() {
        let reference = Reference {
            node: Atom::from("tool@localhost"),
            ids: vec![1, 2, 3],
            creation: 1,
        };
        let target = MonitorTarget::Name {
            name: Atom::from("rex"),
            node: Atom::from("backend@localhost"),
        };
        let msg = down_message(reference.clone(), &target, Term::atom("noconnection"));
        let fields = msg.tagged("DOWN", 5).unwrap();
        assert_eq!(fields[1], Term::Ref(reference));
        assert_eq!(fields[3].to_string(), "{rex,backend@localhost}");
        assert!(fields[4].is_atom("noconnection"));
    }
}
