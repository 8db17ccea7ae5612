//! Handshake driver -- runs the name/status/challenge exchange over a fresh
//! socket and hands back the socket plus what was negotiated.
//!
//! Initiator: send name, receive status, receive challenge, (complement),
//! send reply, receive ack. The acceptor side mirrors it and is used by
//! in-process peers.

use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;

use beamlink_crypto::{gen_challenge, gen_digest, verify_digest, Cookie};
use beamlink_protocol::handshake::advertised_range;
use beamlink_protocol::{
    flags, negotiate_version, Atom, Expect, HandshakeCodec, HandshakeMessage, Status, VERSION_MAX,
    VERSION_MIN,
};

use crate::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    NameSent,
    StatusReceived,
    ChallengeReceived,
    ReplySent,
    Connected,
    Failed,
}

/// What we present to the peer.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub name: Atom,
    pub flags: u64,
    pub creation: u32,
    pub cookie: Cookie,
}

/// Negotiated parameters of an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: Atom,
    pub version: u16,
    pub flags: u64,
    /// Zero when a version-5 peer never sent one.
    pub creation: u32,
}

/// A socket that finished the handshake. `read_buf` holds bytes the peer
/// sent after its last handshake message; they belong to the framed phase.
#[derive(Debug)]
pub struct Established<T> {
    pub io: T,
    pub read_buf: BytesMut,
    pub info: ConnectionInfo,
}

struct Progress<'a> {
    peer: &'a str,
    state: HandshakeState,
}

impl<'a> Progress<'a> {
    fn new(peer: &'a str) -> Self {
        Self {
            peer,
            state: HandshakeState::Init,
        }
    }

    fn advance(&mut self, next: HandshakeState) {
        tracing::trace!(peer = self.peer, from = ?self.state, to = ?next, "handshake: state");
        self.state = next;
    }

    fn fail(&mut self, err: &NodeError) {
        tracing::debug!(peer = self.peer, at = ?self.state, error = %err, "handshake: failed");
        self.state = HandshakeState::Failed;
    }
}

type Channel<T> = Framed<T, HandshakeCodec>;

/// Next message, read at step `expect`. The whole exchange shares one deadline.
async fn recv<T>(
    framed: &mut Channel<T>,
    expect: Expect,
    deadline: Instant,
) -> Result<HandshakeMessage, NodeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let body = match tokio::time::timeout_at(deadline, framed.next()).await {
        Err(_) => {
            return Err(NodeError::Timeout(format!(
                "handshake deadline passed waiting for {expect:?}"
            )))
        }
        Ok(None) => {
            return Err(NodeError::Connection(format!(
                "peer closed during handshake ({expect:?})"
            )))
        }
        Ok(Some(body)) => body?,
    };
    Ok(HandshakeMessage::decode(&body, expect)?)
}

fn unexpected(msg: &HandshakeMessage) -> NodeError {
    NodeError::Connection(format!("unexpected handshake message {msg:?}"))
}

fn check_required(peer: &str, peer_flags: u64) -> Result<(), NodeError> {
    let missing = flags::REQUIRED_FLAGS & !peer_flags;
    if missing != 0 {
        return Err(NodeError::Connection(format!(
            "{peer} lacks required distribution flags {missing:#x}"
        )));
    }
    Ok(())
}

fn pick_version(peer: &str, range: (u16, u16)) -> Result<u16, NodeError> {
    match negotiate_version(range.0, range.1) {
        0 => Err(NodeError::Connection(format!(
            "{peer} speaks versions {}..={}, we speak {VERSION_MIN}..={VERSION_MAX}",
            range.0, range.1
        ))),
        v => Ok(v),
    }
}

fn finish<T>(framed: Channel<T>, info: ConnectionInfo) -> Established<T> {
    let parts = framed.into_parts();
    Established {
        io: parts.io,
        read_buf: parts.read_buf,
        info,
    }
}

// ============================================================================
// Initiator
// ============================================================================

/// Run the initiating side against `peer`, whose discovery entry advertised
/// `peer_range` (lowest, highest).
pub async fn connect<T>(
    io: T,
    local: &LocalIdentity,
    peer: &Atom,
    peer_range: (u16, u16),
    limit: Duration,
) -> Result<Established<T>, NodeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut progress = Progress::new(peer.as_str());
    let deadline = Instant::now() + limit;
    // Writes count against the deadline too, not just reads
    let res = tokio::time::timeout_at(
        deadline,
        initiate(io, local, peer, peer_range, deadline, &mut progress),
    )
    .await;
    let res = res.unwrap_or_else(|_| {
        Err(NodeError::Timeout(format!(
            "handshake with {} did not finish in time",
            peer.as_str()
        )))
    });
    match &res {
        Ok(est) => tracing::debug!(peer = %peer, version = est.info.version, "handshake: connected"),
        Err(e) => progress.fail(e),
    }
    res
}

async fn initiate<T>(
    io: T,
    local: &LocalIdentity,
    peer: &Atom,
    peer_range: (u16, u16),
    deadline: Instant,
    progress: &mut Progress<'_>,
) -> Result<Established<T>, NodeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, HandshakeCodec);
    let offered = pick_version(peer.as_str(), peer_range)?;

    let sent_v6 = offered >= 6;
    let name = if sent_v6 {
        HandshakeMessage::NameV6 {
            flags: local.flags,
            creation: local.creation,
            name: local.name.as_str().to_string(),
        }
    } else {
        HandshakeMessage::Name {
            version: 5,
            flags: local.flags,
            name: local.name.as_str().to_string(),
        }
    };
    framed.send(name).await?;
    progress.advance(HandshakeState::NameSent);

    let status = match recv(&mut framed, Expect::Status, deadline).await? {
        HandshakeMessage::Status(s) => s,
        other => return Err(unexpected(&other)),
    };
    match status {
        Status::Ok | Status::OkSimultaneous => {}
        Status::Alive => {
            // We never replace an existing connection
            framed.send(HandshakeMessage::Status(Status::Continue(false))).await?;
            return Err(NodeError::Connection(format!(
                "{peer} already has a connection from {}",
                local.name
            )));
        }
        other => {
            return Err(NodeError::Connection(format!(
                "{peer} refused the connection: {}",
                other.as_str()
            )))
        }
    }
    progress.advance(HandshakeState::StatusReceived);

    let (peer_name, peer_flags, challenge, creation, range) =
        match recv(&mut framed, Expect::Challenge, deadline).await? {
            HandshakeMessage::Challenge {
                version,
                flags,
                challenge,
                name,
            } => (name, flags, challenge, 0, advertised_range(version, flags)),
            HandshakeMessage::ChallengeV6 {
                flags,
                challenge,
                creation,
                name,
            } => (name, flags, challenge, creation, (6, 6)),
            other => return Err(unexpected(&other)),
        };
    if peer_name != peer.as_str() {
        return Err(NodeError::Connection(format!(
            "expected {peer}, but the peer calls itself {peer_name}"
        )));
    }
    let version = pick_version(peer.as_str(), range)?;
    check_required(peer.as_str(), peer_flags)?;
    progress.advance(HandshakeState::ChallengeReceived);

    if !sent_v6 && range.0 >= 6 {
        framed
            .send(HandshakeMessage::Complement {
                flags_high: (local.flags >> 32) as u32,
                creation: local.creation,
            })
            .await?;
    }

    let ours = gen_challenge();
    framed
        .send(HandshakeMessage::ChallengeReply {
            challenge: ours,
            digest: gen_digest(challenge, &local.cookie),
        })
        .await?;
    progress.advance(HandshakeState::ReplySent);

    let digest = match recv(&mut framed, Expect::Ack, deadline).await {
        Ok(HandshakeMessage::ChallengeAck { digest }) => digest,
        Ok(other) => return Err(unexpected(&other)),
        // The peer drops the socket instead of acking a bad digest
        Err(NodeError::Connection(_)) => {
            return Err(NodeError::Authentication(format!(
                "{peer} closed the connection after our challenge reply; check the cookie"
            )))
        }
        Err(e) => return Err(e),
    };
    if !verify_digest(ours, &local.cookie, &digest) {
        return Err(NodeError::Authentication(format!(
            "{peer} answered our challenge with a wrong digest"
        )));
    }
    progress.advance(HandshakeState::Connected);

    Ok(finish(
        framed,
        ConnectionInfo {
            peer: peer.clone(),
            version,
            flags: peer_flags,
            creation,
        },
    ))
}

// ============================================================================
// Acceptor
// ============================================================================

/// Run the accepting side. The peer's name comes from its name message.
pub async fn accept<T>(
    io: T,
    local: &LocalIdentity,
    limit: Duration,
) -> Result<Established<T>, NodeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + limit;
    let res = tokio::time::timeout_at(deadline, respond(io, local, deadline)).await;
    let res = res.unwrap_or_else(|_| {
        Err(NodeError::Timeout(
            "incoming handshake did not finish in time".into(),
        ))
    });
    match &res {
        Ok(est) => tracing::debug!(peer = %est.info.peer, version = est.info.version, "handshake: accepted"),
        Err(e) => tracing::debug!(error = %e, "handshake: incoming failed"),
    }
    res
}

async fn respond<T>(
    io: T,
    local: &LocalIdentity,
    deadline: Instant,
) -> Result<Established<T>, NodeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, HandshakeCodec);

    let (peer_name, mut peer_flags, mut creation, range, sent_v6) =
        match recv(&mut framed, Expect::Name, deadline).await? {
            HandshakeMessage::Name {
                version,
                flags,
                name,
            } => (name, flags, 0, advertised_range(version, flags), false),
            HandshakeMessage::NameV6 {
                flags,
                creation,
                name,
            } => (name, flags, creation, (6, 6), true),
            other => return Err(unexpected(&other)),
        };
    let version = pick_version(&peer_name, range)?;
    if let Err(e) = check_required(&peer_name, peer_flags) {
        framed.send(HandshakeMessage::Status(Status::NotAllowed)).await?;
        return Err(e);
    }
    framed.send(HandshakeMessage::Status(Status::Ok)).await?;

    let ours = gen_challenge();
    let challenge = if version >= 6 {
        HandshakeMessage::ChallengeV6 {
            flags: local.flags,
            challenge: ours,
            creation: local.creation,
            name: local.name.as_str().to_string(),
        }
    } else {
        HandshakeMessage::Challenge {
            version: 5,
            flags: local.flags,
            challenge: ours,
            name: local.name.as_str().to_string(),
        }
    };
    framed.send(challenge).await?;

    let mut reply = recv(&mut framed, Expect::Reply, deadline).await?;
    if let HandshakeMessage::Complement {
        flags_high,
        creation: c,
    } = reply
    {
        if sent_v6 || version < 6 {
            return Err(unexpected(&reply));
        }
        peer_flags |= (flags_high as u64) << 32;
        creation = c;
        reply = recv(&mut framed, Expect::Reply, deadline).await?;
    }
    let (theirs, digest) = match reply {
        HandshakeMessage::ChallengeReply { challenge, digest } => (challenge, digest),
        other => return Err(unexpected(&other)),
    };
    if !verify_digest(ours, &local.cookie, &digest) {
        return Err(NodeError::Authentication(format!(
            "{peer_name} sent a wrong challenge digest"
        )));
    }
    framed
        .send(HandshakeMessage::ChallengeAck {
            digest: gen_digest(theirs, &local.cookie),
        })
        .await?;

    Ok(finish(
        framed,
        ConnectionInfo {
            peer: Atom::from(peer_name),
            version,
            flags: peer_flags,
            creation,
        },
    ))
}
