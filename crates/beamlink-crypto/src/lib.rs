//! beamlink crypto -- shared-secret cookie and the handshake challenge digest.
//!
//! The peer runtime authenticates both ends with MD5 over the cookie and the
//! decimal text of a 32-bit challenge:
//! - digest = MD5(cookie ++ decimal(challenge)), 16 bytes
//! - comparison is constant time

pub mod cookie;

pub use cookie::Cookie;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("cookie file {path} is empty")]
    EmptyCookie { path: String },
    #[error("cookie contains non-printable bytes")]
    InvalidCookie,
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fresh random challenge for the accepting side or our reply.
pub fn gen_challenge() -> u32 {
    rand::random::<u32>()
}

/// Digest the peer expects for `challenge` under `cookie`.
pub fn gen_digest(challenge: u32, cookie: &Cookie) -> [u8; DIGEST_LEN] {
    let mut ctx = md5::Context::new();
    ctx.consume(cookie.expose().as_bytes());
    ctx.consume(challenge.to_string().as_bytes());
    ctx.compute().0
}

/// Check a received digest against the one we expect, in constant time.
pub fn verify_digest(challenge: u32, cookie: &Cookie, received: &[u8]) -> bool {
    let expected = gen_digest(challenge, cookie);
    if received.len() != expected.len() {
        return false;
    }
    expected
        .iter()
        .zip(received)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Hex form of a digest for trace output.
pub fn digest_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}
