//! Events pushed by the peer, and connection status notifications.
//!
//! The peer sends `{event, Topic, Data, Sender}` (or `{event, Topic, Data}`)
//! to the event mailbox. An [`EventDaemon`] drains that mailbox and hands each
//! event to its handlers. Status handlers follow the node's up/down channel.
//! Both stop when their handle is dropped or the node closes.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use beamlink_protocol::{Atom, FromTerm, Pid, Term};

use crate::mailbox::{Mailbox, ReceiveError};
use crate::node::{Node, StatusEvent};

/// One event from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub data: Term,
    pub sender: Option<Pid>,
}

impl Event {
    pub fn from_term(term: &Term) -> Option<Self> {
        let fields = term
            .tagged("event", 4)
            .or_else(|| term.tagged("event", 3))?;
        let topic = String::from_term(&fields[1]).ok()?;
        let sender = fields.get(3).and_then(|s| s.as_pid()).cloned();
        Some(Event {
            topic,
            data: fields[2].clone(),
            sender,
        })
    }
}

pub trait EventHandler: Send + Sync {
    /// Topics this handler wants. All by default.
    fn handles(&self, _topic: &str) -> bool {
        true
    }

    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

/// Writes `log` events to the local log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventHandler;

impl EventHandler for LogEventHandler {
    fn handles(&self, topic: &str) -> bool {
        topic == "log"
    }

    fn handle(&self, event: &Event) {
        let text = String::from_term(&event.data).unwrap_or_else(|_| event.data.to_string());
        match &event.sender {
            Some(sender) => tracing::info!(sender = %sender, "events: {text}"),
            None => tracing::info!("events: {text}"),
        }
    }
}

type Handlers = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

/// Drains the event mailbox on a background task.
pub struct EventDaemon {
    handlers: Handlers,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl EventDaemon {
    pub fn start(mailbox: Arc<Mailbox>) -> Self {
        let handlers: Handlers = Arc::new(RwLock::new(Vec::new()));
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_event_loop(mailbox, Arc::clone(&handlers), shutdown_rx));
        Self {
            handlers,
            shutdown,
            task,
        }
    }

    pub fn add_handler(&self, handler: impl EventHandler + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for EventDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_event_loop(
    mailbox: Arc<Mailbox>,
    handlers: Handlers,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(pid = %mailbox.pid(), "events: daemon started");
    loop {
        let msg = tokio::select! {
            _ = shutdown.recv() => break,
            msg = mailbox.receive(None) => msg,
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(ReceiveError::Exit { from, reason }) => {
                tracing::warn!(from = %from, reason = %reason, "events: mailbox killed");
                break;
            }
            Err(_) => break,
        };
        let Some(event) = Event::from_term(&msg) else {
            tracing::debug!(message = %msg, "events: ignoring non-event message");
            continue;
        };
        // Snapshot so handlers may add handlers
        let current: Vec<Arc<dyn EventHandler>> = handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.handles(&event.topic))
            .cloned()
            .collect();
        tracing::trace!(topic = %event.topic, handlers = current.len(), "events: dispatch");
        for handler in current {
            handler.handle(&event);
        }
    }
    tracing::debug!(pid = %mailbox.pid(), "events: daemon stopped");
}

// ============================================================================
// Status
// ============================================================================

pub trait StatusHandler: Send + 'static {
    fn remote_status(&self, peer: &Atom, up: bool);
}

impl<F> StatusHandler for F
where
    F: Fn(&Atom, bool) + Send + 'static,
{
    fn remote_status(&self, peer: &Atom, up: bool) {
        self(peer, up)
    }
}

/// Live registration of a [`StatusHandler`]. Dropping it unregisters.
#[derive(Debug)]
pub struct StatusSubscription {
    task: JoinHandle<()>,
}

impl StatusSubscription {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn register_status_handler(node: &Node, handler: impl StatusHandler) -> StatusSubscription {
    let mut rx = node.subscribe_status();
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(StatusEvent { peer, up }) => handler.remote_status(&peer, up),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("events: status handler lagged, missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    StatusSubscription { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamlink_crypto::Cookie;
    use std::sync::Mutex;
    use std::time::Duration;

    fn node() -> Node {
        Node::new("tool@localhost", Cookie::new("c").unwrap()).unwrap()
    }

    fn event(topic: &str, data: Term) -> Term {
        Term::tuple(vec![Term::atom("event"), Term::atom(topic), data])
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[test]
    fn test_event_parse() {
        let sender = Pid::new("backend@localhost", 5, 0, 1);
        let term = Term::tuple(vec![
            Term::atom("event"),
            Term::binary(b"build".to_vec()),
            Term::from(3),
            Term::Pid(sender.clone()),
        ]);
        let ev = Event::from_term(&term).unwrap();
        assert_eq!(ev.topic, "build");
        assert_eq!(ev.data, Term::from(3));
        assert_eq!(ev.sender, Some(sender));

        let ev = Event::from_term(&event("log", Term::charlist("hi"))).unwrap();
        assert_eq!(ev.topic, "log");
        assert_eq!(ev.sender, None);

        assert!(Event::from_term(&Term::atom("event")).is_none());
        assert!(Event::from_term(&Term::tuple(vec![Term::atom("event"), Term::from(1), Term::nil()])).is_none());
    }

    #[tokio::test]
    async fn test_daemon_dispatches_by_topic() {
        let node = node();
        let events = Arc::new(node.create_mailbox(Some("rex")).unwrap());
        let daemon = EventDaemon::start(Arc::clone(&events));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        daemon.add_handler(move |ev: &Event| sink.lock().unwrap().push(ev.topic.clone()));
        daemon.add_handler(LogEventHandler);
        assert_eq!(daemon.handler_count(), 2);

        let sender = node.create_mailbox(None).unwrap();
        sender.send(Atom::from("rex"), event("log", Term::charlist("compiled"))).unwrap();
        sender.send(Atom::from("rex"), Term::atom("noise")).unwrap();
        sender.send(Atom::from("rex"), event("build", Term::nil())).unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["log".to_string(), "build".to_string()]);
        daemon.stop();
        settle().await;
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn test_daemon_stops_when_mailbox_closes() {
        let node = node();
        let events = Arc::new(node.create_mailbox(None).unwrap());
        let daemon = EventDaemon::start(Arc::clone(&events));
        settle().await;
        assert!(daemon.is_running());
        events.close();
        settle().await;
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn test_status_handler() {
        let node = node();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = register_status_handler(&node, move |peer: &Atom, up: bool| {
            sink.lock().unwrap().push((peer.to_string(), up));
        });

        let peer = Atom::from("backend@localhost");
        node.publish_status(&peer, true);
        node.publish_status(&peer, false);
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("backend@localhost".to_string(), true),
                ("backend@localhost".to_string(), false)
            ]
        );

        node.close();
        settle().await;
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let node = node();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let sub = register_status_handler(&node, move |_: &Atom, _: bool| {
            *sink.lock().unwrap() += 1;
        });
        drop(sub);
        settle().await;
        node.publish_status(&Atom::from("backend@localhost"), true);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
