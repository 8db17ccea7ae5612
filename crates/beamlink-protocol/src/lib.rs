//! beamlink protocol -- term model, external term format, distribution wire.
//!
//! TCP to the peer runtime. Handshake messages carry a 2-byte big-endian
//! length prefix, connected traffic a 4-byte prefix (zero length = tick).

pub mod codec;
pub mod control;
pub mod convert;
pub mod epmd;
pub mod etf;
pub mod handshake;
pub mod params;
pub mod term;

pub use codec::{decode_message, encode_message, DistCodec, Frame};
pub use control::{ControlMessage, Target};
pub use convert::{decode_as, FromTerm, RangeError, TermError};
pub use etf::{decode, decode_body, decode_exact, encode, encode_body};
pub use etf::{DecodeError, DecodeReason, EncodeError};
pub use handshake::{flags, negotiate_version, Expect, HandshakeCodec, HandshakeMessage, Status};
pub use params::{DistParams, DEFAULT_PARAMS};
pub use term::{Atom, Pid, Port, Reference, Term};

/// Lowest distribution protocol version we speak.
pub const VERSION_MIN: u16 = 5;

/// Highest distribution protocol version we speak.
pub const VERSION_MAX: u16 = 6;

/// Well-known port of the node discovery service (sourced from default params).
pub const EPMD_PORT: u16 = DEFAULT_PARAMS.epmd_port;

/// Registered name of the peer's remote call service.
pub const REX: &str = "rex";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Term(#[from] TermError),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported control operation {0}")]
    UnsupportedControl(i64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RangeError> for ProtocolError {
    fn from(err: RangeError) -> Self {
        ProtocolError::Term(TermError::Range(err))
    }
}
