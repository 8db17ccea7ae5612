//! Control messages carried in connected data frames.
//!
//! Each frame holds a control tuple whose first element is the operation
//! code, optionally followed by a payload term. Trace-token variants and the
//! payload forms of exit signals decode into the same variants as their plain
//! counterparts; the token is dropped.

use crate::convert::FromTerm;
use crate::term::{Atom, Pid, Reference, Term};
use crate::ProtocolError;

pub mod op {
    pub const LINK: i64 = 1;
    pub const SEND: i64 = 2;
    pub const EXIT: i64 = 3;
    pub const UNLINK: i64 = 4;
    pub const REG_SEND: i64 = 6;
    pub const EXIT2: i64 = 8;
    pub const SEND_TT: i64 = 12;
    pub const EXIT_TT: i64 = 13;
    pub const REG_SEND_TT: i64 = 16;
    pub const EXIT2_TT: i64 = 18;
    pub const MONITOR_P: i64 = 19;
    pub const DEMONITOR_P: i64 = 20;
    pub const MONITOR_P_EXIT: i64 = 21;
    pub const SEND_SENDER: i64 = 22;
    pub const SEND_SENDER_TT: i64 = 23;
    pub const PAYLOAD_EXIT: i64 = 24;
    pub const PAYLOAD_EXIT_TT: i64 = 25;
    pub const PAYLOAD_EXIT2: i64 = 26;
    pub const PAYLOAD_EXIT2_TT: i64 = 27;
    pub const PAYLOAD_MONITOR_P_EXIT: i64 = 28;
    pub const UNLINK_ID: i64 = 35;
    pub const UNLINK_ID_ACK: i64 = 36;
}

/// A process addressed either by pid or by registered name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Pid(Pid),
    Name(Atom),
}

impl Target {
    fn to_term(&self) -> Term {
        match self {
            Target::Pid(p) => Term::Pid(p.clone()),
            Target::Name(n) => Term::Atom(n.clone()),
        }
    }

    fn from_term(term: &Term) -> Result<Self, ProtocolError> {
        match term {
            Term::Pid(p) => Ok(Target::Pid(p.clone())),
            Term::Atom(a) => Ok(Target::Name(a.clone())),
            other => Err(ProtocolError::Malformed(format!(
                "expected pid or name, found {other}"
            ))),
        }
    }
}

impl From<Pid> for Target {
    fn from(p: Pid) -> Self {
        Target::Pid(p)
    }
}

impl From<Atom> for Target {
    fn from(a: Atom) -> Self {
        Target::Name(a)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Link {
        from: Pid,
        to: Pid,
    },
    Send {
        to: Pid,
        message: Term,
    },
    Exit {
        from: Pid,
        to: Pid,
        reason: Term,
    },
    Unlink {
        from: Pid,
        to: Pid,
    },
    RegSend {
        from: Pid,
        to_name: Atom,
        message: Term,
    },
    Exit2 {
        from: Pid,
        to: Pid,
        reason: Term,
    },
    MonitorP {
        from: Pid,
        to: Target,
        reference: Reference,
    },
    DemonitorP {
        from: Pid,
        to: Target,
        reference: Reference,
    },
    MonitorPExit {
        from: Target,
        to: Pid,
        reference: Reference,
        reason: Term,
    },
    SendSender {
        from: Pid,
        to: Pid,
        message: Term,
    },
    UnlinkId {
        id: u64,
        from: Pid,
        to: Pid,
    },
    UnlinkIdAck {
        id: u64,
        from: Pid,
        to: Pid,
    },
}

impl ControlMessage {
    /// Operation code this message is sent with.
    pub fn op(&self) -> i64 {
        match self {
            ControlMessage::Link { .. } => op::LINK,
            ControlMessage::Send { .. } => op::SEND,
            ControlMessage::Exit { .. } => op::EXIT,
            ControlMessage::Unlink { .. } => op::UNLINK,
            ControlMessage::RegSend { .. } => op::REG_SEND,
            ControlMessage::Exit2 { .. } => op::EXIT2,
            ControlMessage::MonitorP { .. } => op::MONITOR_P,
            ControlMessage::DemonitorP { .. } => op::DEMONITOR_P,
            ControlMessage::MonitorPExit { .. } => op::MONITOR_P_EXIT,
            ControlMessage::SendSender { .. } => op::SEND_SENDER,
            ControlMessage::UnlinkId { .. } => op::UNLINK_ID,
            ControlMessage::UnlinkIdAck { .. } => op::UNLINK_ID_ACK,
        }
    }

    /// Split into the control tuple and optional payload.
    pub fn to_terms(&self) -> (Term, Option<Term>) {
        let code = Term::Integer(self.op());
        let pid = |p: &Pid| Term::Pid(p.clone());
        let unused = Term::atom("");
        match self {
            ControlMessage::Link { from, to } | ControlMessage::Unlink { from, to } => {
                (Term::tuple(vec![code, pid(from), pid(to)]), None)
            }
            ControlMessage::Send { to, message } => (
                Term::tuple(vec![code, unused, pid(to)]),
                Some(message.clone()),
            ),
            ControlMessage::Exit { from, to, reason }
            | ControlMessage::Exit2 { from, to, reason } => (
                Term::tuple(vec![code, pid(from), pid(to), reason.clone()]),
                None,
            ),
            ControlMessage::RegSend {
                from,
                to_name,
                message,
            } => (
                Term::tuple(vec![code, pid(from), unused, Term::Atom(to_name.clone())]),
                Some(message.clone()),
            ),
            ControlMessage::MonitorP {
                from,
                to,
                reference,
            }
            | ControlMessage::DemonitorP {
                from,
                to,
                reference,
            } => (
                Term::tuple(vec![
                    code,
                    pid(from),
                    to.to_term(),
                    Term::Ref(reference.clone()),
                ]),
                None,
            ),
            ControlMessage::MonitorPExit {
                from,
                to,
                reference,
                reason,
            } => (
                Term::tuple(vec![
                    code,
                    from.to_term(),
                    pid(to),
                    Term::Ref(reference.clone()),
                    reason.clone(),
                ]),
                None,
            ),
            ControlMessage::SendSender { from, to, message } => (
                Term::tuple(vec![code, pid(from), pid(to)]),
                Some(message.clone()),
            ),
            ControlMessage::UnlinkId { id, from, to }
            | ControlMessage::UnlinkIdAck { id, from, to } => (
                Term::tuple(vec![code, Term::from(*id), pid(from), pid(to)]),
                None,
            ),
        }
    }

    /// Interpret a control tuple and its payload.
    pub fn from_terms(control: &Term, payload: Option<Term>) -> Result<Self, ProtocolError> {
        let elems = control
            .as_tuple()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ProtocolError::Malformed(format!("control is not a tuple: {control}")))?;
        let code = i64::from_term(&elems[0])?;

        let arity = |n: usize| -> Result<(), ProtocolError> {
            if elems.len() == n {
                Ok(())
            } else {
                Err(ProtocolError::Malformed(format!(
                    "control op {code} with arity {}, expected {n}",
                    elems.len()
                )))
            }
        };
        let pid = |i: usize| Pid::from_term(&elems[i]).map_err(ProtocolError::from);
        let reference = |i: usize| Reference::from_term(&elems[i]).map_err(ProtocolError::from);
        let mut payload = payload;
        let mut take_payload = || {
            payload
                .take()
                .ok_or_else(|| ProtocolError::Malformed(format!("control op {code} without payload")))
        };

        let msg = match code {
            op::LINK => {
                arity(3)?;
                ControlMessage::Link {
                    from: pid(1)?,
                    to: pid(2)?,
                }
            }
            op::UNLINK => {
                arity(3)?;
                ControlMessage::Unlink {
                    from: pid(1)?,
                    to: pid(2)?,
                }
            }
            op::SEND | op::SEND_TT => {
                arity(if code == op::SEND { 3 } else { 4 })?;
                ControlMessage::Send {
                    to: pid(2)?,
                    message: take_payload()?,
                }
            }
            op::REG_SEND | op::REG_SEND_TT => {
                arity(if code == op::REG_SEND { 4 } else { 5 })?;
                ControlMessage::RegSend {
                    from: pid(1)?,
                    to_name: Atom::from_term(&elems[3])?,
                    message: take_payload()?,
                }
            }
            op::SEND_SENDER | op::SEND_SENDER_TT => {
                arity(if code == op::SEND_SENDER { 3 } else { 4 })?;
                ControlMessage::SendSender {
                    from: pid(1)?,
                    to: pid(2)?,
                    message: take_payload()?,
                }
            }
            op::EXIT | op::EXIT2 => {
                arity(4)?;
                exit(code == op::EXIT, pid(1)?, pid(2)?, elems[3].clone())
            }
            op::EXIT_TT | op::EXIT2_TT => {
                arity(5)?;
                exit(code == op::EXIT_TT, pid(1)?, pid(2)?, elems[4].clone())
            }
            op::PAYLOAD_EXIT | op::PAYLOAD_EXIT2 => {
                arity(3)?;
                exit(code == op::PAYLOAD_EXIT, pid(1)?, pid(2)?, take_payload()?)
            }
            op::PAYLOAD_EXIT_TT | op::PAYLOAD_EXIT2_TT => {
                arity(4)?;
                exit(code == op::PAYLOAD_EXIT_TT, pid(1)?, pid(2)?, take_payload()?)
            }
            op::MONITOR_P => {
                arity(4)?;
                ControlMessage::MonitorP {
                    from: pid(1)?,
                    to: Target::from_term(&elems[2])?,
                    reference: reference(3)?,
                }
            }
            op::DEMONITOR_P => {
                arity(4)?;
                ControlMessage::DemonitorP {
                    from: pid(1)?,
                    to: Target::from_term(&elems[2])?,
                    reference: reference(3)?,
                }
            }
            op::MONITOR_P_EXIT => {
                arity(5)?;
                ControlMessage::MonitorPExit {
                    from: Target::from_term(&elems[1])?,
                    to: pid(2)?,
                    reference: reference(3)?,
                    reason: elems[4].clone(),
                }
            }
            op::PAYLOAD_MONITOR_P_EXIT => {
                arity(4)?;
                ControlMessage::MonitorPExit {
                    from: Target::from_term(&elems[1])?,
                    to: pid(2)?,
                    reference: reference(3)?,
                    reason: take_payload()?,
                }
            }
            op::UNLINK_ID | op::UNLINK_ID_ACK => {
                arity(4)?;
                let id = u64::from_term(&elems[1])?;
                let (from, to) = (pid(2)?, pid(3)?);
                if code == op::UNLINK_ID {
                    ControlMessage::UnlinkId { id, from, to }
                } else {
                    ControlMessage::UnlinkIdAck { id, from, to }
                }
            }
            other => return Err(ProtocolError::UnsupportedControl(other)),
        };
        Ok(msg)
    }
}

fn exit(link_exit: bool, from: Pid, to: Pid, reason: Term) -> ControlMessage {
    if link_exit {
        ControlMessage::Exit { from, to, reason }
    } else {
        ControlMessage::Exit2 { from, to, reason }
    }
}
