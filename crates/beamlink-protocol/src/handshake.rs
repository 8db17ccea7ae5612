//! Distribution handshake wire messages.
//!
//! Every handshake message travels with a 2-byte big-endian length prefix
//! and starts with a one-byte tag. `'n'` is used both for the version-5 name
//! and the version-5 challenge, so decoding needs to know which step the
//! exchange is at ([`Expect`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, VERSION_MAX, VERSION_MIN};

/// Distribution capability flags.
pub mod flags {
    pub const PUBLISHED: u64 = 0x1;
    pub const ATOM_CACHE: u64 = 0x2;
    pub const EXTENDED_REFERENCES: u64 = 0x4;
    pub const DIST_MONITOR: u64 = 0x8;
    pub const FUN_TAGS: u64 = 0x10;
    pub const DIST_MONITOR_NAME: u64 = 0x20;
    pub const HIDDEN_ATOM_CACHE: u64 = 0x40;
    pub const NEW_FUN_TAGS: u64 = 0x80;
    pub const EXTENDED_PIDS_PORTS: u64 = 0x100;
    pub const EXPORT_PTR_TAG: u64 = 0x200;
    pub const BIT_BINARIES: u64 = 0x400;
    pub const NEW_FLOATS: u64 = 0x800;
    pub const UNICODE_IO: u64 = 0x1000;
    pub const DIST_HDR_ATOM_CACHE: u64 = 0x2000;
    pub const SMALL_ATOM_TAGS: u64 = 0x4000;
    pub const UTF8_ATOMS: u64 = 0x10000;
    pub const MAP_TAG: u64 = 0x20000;
    pub const BIG_CREATION: u64 = 0x40000;
    pub const SEND_SENDER: u64 = 0x80000;
    pub const BIG_SEQTRACE_LABELS: u64 = 0x100000;
    pub const EXIT_PAYLOAD: u64 = 0x400000;
    pub const FRAGMENTS: u64 = 0x800000;
    pub const HANDSHAKE_23: u64 = 0x1000000;
    pub const UNLINK_ID: u64 = 0x2000000;
    pub const SPAWN: u64 = 1 << 32;
    pub const NAME_ME: u64 = 1 << 33;
    pub const V4_NC: u64 = 1 << 34;
    pub const ALIAS: u64 = 1 << 35;

    /// What we advertise. Not `PUBLISHED`: we run as a hidden node.
    pub const DEFAULT_FLAGS: u64 = EXTENDED_REFERENCES
        | DIST_MONITOR
        | FUN_TAGS
        | NEW_FUN_TAGS
        | EXTENDED_PIDS_PORTS
        | EXPORT_PTR_TAG
        | BIT_BINARIES
        | NEW_FLOATS
        | UNICODE_IO
        | SMALL_ATOM_TAGS
        | UTF8_ATOMS
        | MAP_TAG
        | BIG_CREATION
        | SEND_SENDER
        | HANDSHAKE_23
        | UNLINK_ID
        | V4_NC;

    /// What the peer must advertise for us to talk to it.
    pub const REQUIRED_FLAGS: u64 =
        EXTENDED_REFERENCES | EXTENDED_PIDS_PORTS | UTF8_ATOMS | NEW_FLOATS | BIG_CREATION;
}

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 2;

/// Digest length (MD5).
pub const DIGEST_LEN: usize = 16;

/// Status sent by the accepting side after the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    OkSimultaneous,
    Nok,
    NotAllowed,
    /// A connection to this name already exists; the initiator answers
    /// with [`Status::Continue`].
    Alive,
    /// Answer to `Alive`: `true` replaces the old connection.
    Continue(bool),
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::OkSimultaneous => "ok_simultaneous",
            Status::Nok => "nok",
            Status::NotAllowed => "not_allowed",
            Status::Alive => "alive",
            Status::Continue(true) => "true",
            Status::Continue(false) => "false",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "ok" => Status::Ok,
            "ok_simultaneous" => Status::OkSimultaneous,
            "nok" => Status::Nok,
            "not_allowed" => Status::NotAllowed,
            "alive" => Status::Alive,
            "true" => Status::Continue(true),
            "false" => Status::Continue(false),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// `'n'` name, version-5 form. Only the low 32 flag bits travel.
    Name {
        version: u16,
        flags: u64,
        name: String,
    },
    /// `'N'` name, version-6 form.
    NameV6 {
        flags: u64,
        creation: u32,
        name: String,
    },
    Status(Status),
    /// `'n'` challenge, version-5 form.
    Challenge {
        version: u16,
        flags: u64,
        challenge: u32,
        name: String,
    },
    /// `'N'` challenge, version-6 form.
    ChallengeV6 {
        flags: u64,
        challenge: u32,
        creation: u32,
        name: String,
    },
    /// `'c'` sent after a version-5 name when the peer answered in version 6.
    Complement { flags_high: u32, creation: u32 },
    ChallengeReply {
        challenge: u32,
        digest: [u8; DIGEST_LEN],
    },
    ChallengeAck {
        digest: [u8; DIGEST_LEN],
    },
}

/// The step an incoming message is read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Name,
    Status,
    Challenge,
    /// Acceptor after its challenge: complement or reply.
    Reply,
    Ack,
}

impl HandshakeMessage {
    /// Encode the message body (no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            HandshakeMessage::Name {
                version,
                flags,
                name,
            } => {
                buf.put_u8(b'n');
                buf.put_u16(*version);
                buf.put_u32(*flags as u32);
                buf.put_slice(name.as_bytes());
            }
            HandshakeMessage::NameV6 {
                flags,
                creation,
                name,
            } => {
                buf.put_u8(b'N');
                buf.put_u64(*flags);
                buf.put_u32(*creation);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
            }
            HandshakeMessage::Status(status) => {
                buf.put_u8(b's');
                buf.put_slice(status.as_str().as_bytes());
            }
            HandshakeMessage::Challenge {
                version,
                flags,
                challenge,
                name,
            } => {
                buf.put_u8(b'n');
                buf.put_u16(*version);
                buf.put_u32(*flags as u32);
                buf.put_u32(*challenge);
                buf.put_slice(name.as_bytes());
            }
            HandshakeMessage::ChallengeV6 {
                flags,
                challenge,
                creation,
                name,
            } => {
                buf.put_u8(b'N');
                buf.put_u64(*flags);
                buf.put_u32(*challenge);
                buf.put_u32(*creation);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
            }
            HandshakeMessage::Complement {
                flags_high,
                creation,
            } => {
                buf.put_u8(b'c');
                buf.put_u32(*flags_high);
                buf.put_u32(*creation);
            }
            HandshakeMessage::ChallengeReply { challenge, digest } => {
                buf.put_u8(b'r');
                buf.put_u32(*challenge);
                buf.put_slice(digest);
            }
            HandshakeMessage::ChallengeAck { digest } => {
                buf.put_u8(b'a');
                buf.put_slice(digest);
            }
        }
        buf.freeze()
    }

    /// Decode a message body read at step `expect`.
    pub fn decode(body: &[u8], expect: Expect) -> Result<Self, ProtocolError> {
        let mut buf = body;
        need(&buf, 1)?;
        let tag = buf.get_u8();
        let msg = match (expect, tag) {
            (Expect::Name, b'n') => {
                need(&buf, 6)?;
                let version = buf.get_u16();
                let flags = buf.get_u32() as u64;
                HandshakeMessage::Name {
                    version,
                    flags,
                    name: text(buf)?,
                }
            }
            (Expect::Name, b'N') => {
                need(&buf, 14)?;
                let flags = buf.get_u64();
                let creation = buf.get_u32();
                let name = sized_text(&mut buf)?;
                HandshakeMessage::NameV6 {
                    flags,
                    creation,
                    name,
                }
            }
            (Expect::Status, b's') => {
                let raw = text(buf)?;
                let status = Status::parse(&raw)
                    .ok_or_else(|| ProtocolError::Malformed(format!("unknown status {raw:?}")))?;
                HandshakeMessage::Status(status)
            }
            (Expect::Challenge, b'n') => {
                need(&buf, 10)?;
                let version = buf.get_u16();
                let flags = buf.get_u32() as u64;
                let challenge = buf.get_u32();
                HandshakeMessage::Challenge {
                    version,
                    flags,
                    challenge,
                    name: text(buf)?,
                }
            }
            (Expect::Challenge, b'N') => {
                need(&buf, 18)?;
                let flags = buf.get_u64();
                let challenge = buf.get_u32();
                let creation = buf.get_u32();
                let name = sized_text(&mut buf)?;
                HandshakeMessage::ChallengeV6 {
                    flags,
                    challenge,
                    creation,
                    name,
                }
            }
            (Expect::Reply, b'c') => {
                need(&buf, 8)?;
                let flags_high = buf.get_u32();
                let creation = buf.get_u32();
                exact_end(&buf)?;
                HandshakeMessage::Complement {
                    flags_high,
                    creation,
                }
            }
            (Expect::Reply, b'r') => {
                need(&buf, 4 + DIGEST_LEN)?;
                let challenge = buf.get_u32();
                let mut digest = [0u8; DIGEST_LEN];
                buf.copy_to_slice(&mut digest);
                exact_end(&buf)?;
                HandshakeMessage::ChallengeReply { challenge, digest }
            }
            (Expect::Ack, b'a') => {
                need(&buf, DIGEST_LEN)?;
                let mut digest = [0u8; DIGEST_LEN];
                buf.copy_to_slice(&mut digest);
                exact_end(&buf)?;
                HandshakeMessage::ChallengeAck { digest }
            }
            (expect, tag) => {
                return Err(ProtocolError::Malformed(format!(
                    "unexpected handshake tag {:?} while expecting {expect:?}",
                    tag as char
                )))
            }
        };
        Ok(msg)
    }
}

fn need(buf: &[u8], n: usize) -> Result<(), ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::Malformed(format!(
            "handshake message truncated: need {n} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn exact_end(buf: &[u8]) -> Result<(), ProtocolError> {
    if !buf.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes in handshake message",
            buf.len()
        )));
    }
    Ok(())
}

fn text(buf: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(buf.to_vec())
        .map_err(|_| ProtocolError::Malformed("handshake text is not utf-8".into()))
}

fn sized_text(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let out = text(&buf[..len])?;
    buf.advance(len);
    Ok(out)
}

/// Pick the version to run with a peer advertising `peer_min..=peer_max`.
/// Returns 0 when there is no overlap.
pub fn negotiate_version(peer_min: u16, peer_max: u16) -> u16 {
    let common_min = peer_min.max(VERSION_MIN);
    let common_max = peer_max.min(VERSION_MAX);
    if common_min <= common_max {
        common_max
    } else {
        0 // no compatible version
    }
}

/// Version range implied by a version-5 form message: the field says 5,
/// `HANDSHAKE_23` says the peer also speaks 6.
pub fn advertised_range(version: u16, peer_flags: u64) -> (u16, u16) {
    if peer_flags & flags::HANDSHAKE_23 != 0 {
        (version, version.max(6))
    } else {
        (version, version)
    }
}

/// Codec for the 2-byte length prefixed handshake phase.
#[derive(Debug, Default, Clone)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<HandshakeMessage> for HandshakeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: HandshakeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.encode();
        let len = u16::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: body.len(),
            max: u16::MAX as usize,
        })?;
        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u16(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
