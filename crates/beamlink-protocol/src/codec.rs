//! Length-delimited frame codec for connected distribution sockets.
//!
//! Wire format: 4-byte big-endian length prefix + frame body. A zero length
//! is a tick. A data body is the pass-through byte `112`, a versioned control
//! term and an optional versioned payload term.
//!
//! The codec only frames. Bodies are interpreted by [`decode_message`] so a
//! malformed body can be skipped without tearing down the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::control::ControlMessage;
use crate::{etf, ProtocolError, DEFAULT_PARAMS};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Leading byte of every data frame body.
pub const PASS_THROUGH: u8 = 112;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keepalive; empty body.
    Tick,
    /// Undecoded data frame body.
    Data(Bytes),
}

/// Codec for framing distribution traffic over a byte stream.
#[derive(Debug, Clone)]
pub struct DistCodec {
    max_frame: usize,
}

impl DistCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for DistCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMS.max_frame_bytes)
    }
}

impl Decoder for DistCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame,
            });
        }

        // Check if we have the full frame
        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        if length == 0 {
            return Ok(Some(Frame::Tick));
        }
        Ok(Some(Frame::Data(src.split_to(length).freeze())))
    }
}

impl Encoder<Frame> for DistCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Tick => dst.put_u32(0),
            Frame::Data(body) => {
                if body.len() > self.max_frame {
                    return Err(ProtocolError::FrameTooLarge {
                        size: body.len(),
                        max: self.max_frame,
                    });
                }
                dst.reserve(LENGTH_PREFIX_SIZE + body.len());
                dst.put_u32(body.len() as u32);
                dst.extend_from_slice(&body);
            }
        }
        Ok(())
    }
}

/// Build the data frame body for a control message.
pub fn encode_message(msg: &ControlMessage) -> Result<Frame, ProtocolError> {
    let (control, payload) = msg.to_terms();
    let mut body = BytesMut::new();
    body.put_u8(PASS_THROUGH);
    etf::write_term(&control, &mut body)?;
    if let Some(payload) = payload {
        etf::write_term(&payload, &mut body)?;
    }
    Ok(Frame::Data(body.freeze()))
}

/// Interpret a data frame body.
pub fn decode_message(body: &[u8]) -> Result<ControlMessage, ProtocolError> {
    match body.first() {
        Some(&PASS_THROUGH) => {}
        Some(other) => {
            return Err(ProtocolError::Malformed(format!(
                "data frame starts with {other}, expected {PASS_THROUGH}"
            )))
        }
        None => return Err(ProtocolError::Malformed("empty data frame".into())),
    }
    let rest = &body[1..];
    let (control, used) = etf::decode(rest)?;
    let rest = &rest[used..];
    let payload = if rest.is_empty() {
        None
    } else {
        Some(etf::decode_exact(rest)?)
    };
    ControlMessage::from_terms(&control, payload)
}
