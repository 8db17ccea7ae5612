//! External term format.
//!
//! Wire layout: optional version byte `131`, then one tag byte per term.
//! Composites carry a length prefix and nest recursively. Decoding treats the
//! buffer as hostile: every length is checked against what remains before
//! anything is allocated, and nesting depth is bounded.

use bytes::{BufMut, Bytes, BytesMut};
use malachite::Integer as BigInteger;

use crate::term::{Atom, Pid, Port, Reference, Term};

/// Version byte that starts a standalone encoded term.
pub const VERSION_MAGIC: u8 = 131;

/// Deepest nesting accepted from a peer.
pub const MAX_DEPTH: usize = 128;

/// Largest bignum magnitude accepted from a peer, in bytes.
pub const MAX_BIG_BYTES: usize = 65_536;

/// Atoms are limited to 255 characters.
pub const MAX_ATOM_CHARS: usize = 255;

// ============================================================================
// Tags
// ============================================================================

pub mod tag {
    pub const NEW_FLOAT: u8 = 70;
    pub const BIT_BINARY: u8 = 77;
    pub const NEW_PID: u8 = 88;
    pub const NEW_PORT: u8 = 89;
    pub const NEWER_REFERENCE: u8 = 90;
    pub const SMALL_INTEGER: u8 = 97;
    pub const INTEGER: u8 = 98;
    pub const FLOAT: u8 = 99;
    pub const ATOM: u8 = 100;
    pub const REFERENCE: u8 = 101;
    pub const PORT: u8 = 102;
    pub const PID: u8 = 103;
    pub const SMALL_TUPLE: u8 = 104;
    pub const LARGE_TUPLE: u8 = 105;
    pub const NIL: u8 = 106;
    pub const STRING: u8 = 107;
    pub const LIST: u8 = 108;
    pub const BINARY: u8 = 109;
    pub const SMALL_BIG: u8 = 110;
    pub const LARGE_BIG: u8 = 111;
    pub const EXPORT: u8 = 113;
    pub const NEW_REFERENCE: u8 = 114;
    pub const SMALL_ATOM: u8 = 115;
    pub const MAP: u8 = 116;
    pub const ATOM_UTF8: u8 = 118;
    pub const SMALL_ATOM_UTF8: u8 = 119;
    pub const V4_PORT: u8 = 120;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("atom longer than {MAX_ATOM_CHARS} characters: {0}")]
    AtomTooLong(usize),
    #[error("{what} too long for the wire: {len}")]
    TooLong { what: &'static str, len: usize },
    #[error("reference must carry 1 to 5 id words, got {0}")]
    BadRefLength(usize),
    #[error("bitstring tail must hold 1 to 7 bits over non-empty data, got {0}")]
    BadBitCount(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeReason {
    #[error("truncated input")]
    Truncated,
    #[error("unknown tag {0}")]
    UnknownTag(u8),
    #[error("unexpected tag {0}")]
    UnexpectedTag(u8),
    #[error("length {0} exceeds remaining input")]
    LengthMismatch(usize),
    #[error("invalid utf-8 in atom")]
    InvalidUtf8,
    #[error("atom longer than {MAX_ATOM_CHARS} characters")]
    AtomTooLong,
    #[error("bad version byte {0}")]
    BadVersion(u8),
    #[error("bad float")]
    BadFloat,
    #[error("bad sign byte {0}")]
    BadSign(u8),
    #[error("bignum of {0} bytes exceeds limit")]
    BigTooLarge(usize),
    #[error("reference with {0} id words")]
    BadRefLength(usize),
    #[error("bit count {0} out of range")]
    BadBitCount(u8),
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("export arity out of range")]
    BadArity,
}

/// Decode failure with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at offset {offset}")]
pub struct DecodeError {
    pub offset: usize,
    pub reason: DecodeReason,
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode with the leading version byte.
pub fn encode(term: &Term) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    write_term(term, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode without the version byte.
pub fn encode_body(term: &Term) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    encode_inner(term, &mut buf)?;
    Ok(buf.freeze())
}

/// Append a versioned term to `buf`.
pub fn write_term(term: &Term, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(VERSION_MAGIC);
    encode_inner(term, buf)
}

fn len_u32(what: &'static str, len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::TooLong { what, len })
}

fn encode_atom(atom: &Atom, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let s = atom.as_str();
    let chars = s.chars().count();
    if chars > MAX_ATOM_CHARS {
        return Err(EncodeError::AtomTooLong(chars));
    }
    if s.len() <= u8::MAX as usize {
        buf.put_u8(tag::SMALL_ATOM_UTF8);
        buf.put_u8(s.len() as u8);
    } else {
        // 255 chars of at most 4 bytes each always fits in u16
        buf.put_u8(tag::ATOM_UTF8);
        buf.put_u16(s.len() as u16);
    }
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn encode_integer(value: i64, buf: &mut BytesMut) {
    if (0..=255).contains(&value) {
        buf.put_u8(tag::SMALL_INTEGER);
        buf.put_u8(value as u8);
    } else if let Ok(v) = i32::try_from(value) {
        buf.put_u8(tag::INTEGER);
        buf.put_i32(v);
    } else {
        let magnitude = value.unsigned_abs().to_le_bytes();
        let len = 8 - magnitude.iter().rev().take_while(|b| **b == 0).count();
        buf.put_u8(tag::SMALL_BIG);
        buf.put_u8(len as u8);
        buf.put_u8(u8::from(value < 0));
        buf.put_slice(&magnitude[..len]);
    }
}

/// Little-endian magnitude bytes and sign of a bignum.
fn big_to_bytes(value: &BigInteger) -> (Vec<u8>, bool) {
    let zero = BigInteger::from(0);
    let negative = *value < zero;
    let mut v = if negative { -value.clone() } else { value.clone() };
    let base = BigInteger::from(256u32);
    let mut bytes = Vec::new();
    while v > zero {
        let rem = &v % &base;
        bytes.push(u64::try_from(&rem).map(|r| r as u8).unwrap_or(0));
        v = &v / &base;
    }
    if bytes.is_empty() {
        bytes.push(0);
    }
    (bytes, negative)
}

fn encode_big(value: &BigInteger, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let (bytes, negative) = big_to_bytes(value);
    if bytes.len() <= u8::MAX as usize {
        buf.put_u8(tag::SMALL_BIG);
        buf.put_u8(bytes.len() as u8);
    } else {
        buf.put_u8(tag::LARGE_BIG);
        buf.put_u32(len_u32("bignum", bytes.len())?);
    }
    buf.put_u8(u8::from(negative));
    buf.put_slice(&bytes);
    Ok(())
}

/// Proper lists of bytes shorter than 64 KiB go out as a string.
fn as_byte_string(elems: &[Term]) -> Option<Vec<u8>> {
    if elems.len() > u16::MAX as usize {
        return None;
    }
    elems
        .iter()
        .map(|e| match e {
            Term::Integer(v) => u8::try_from(*v).ok(),
            _ => None,
        })
        .collect()
}

fn encode_inner(term: &Term, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match term {
        Term::Atom(a) => encode_atom(a, buf)?,
        Term::Integer(v) => encode_integer(*v, buf),
        Term::BigInt(v) => encode_big(v, buf)?,
        Term::Float(v) => {
            buf.put_u8(tag::NEW_FLOAT);
            buf.put_f64(*v);
        }
        Term::Tuple(elems) => {
            if elems.len() <= u8::MAX as usize {
                buf.put_u8(tag::SMALL_TUPLE);
                buf.put_u8(elems.len() as u8);
            } else {
                buf.put_u8(tag::LARGE_TUPLE);
                buf.put_u32(len_u32("tuple", elems.len())?);
            }
            for e in elems {
                encode_inner(e, buf)?;
            }
        }
        Term::List(elems) if elems.is_empty() => buf.put_u8(tag::NIL),
        Term::List(elems) => {
            if let Some(bytes) = as_byte_string(elems) {
                buf.put_u8(tag::STRING);
                buf.put_u16(bytes.len() as u16);
                buf.put_slice(&bytes);
            } else {
                buf.put_u8(tag::LIST);
                buf.put_u32(len_u32("list", elems.len())?);
                for e in elems {
                    encode_inner(e, buf)?;
                }
                buf.put_u8(tag::NIL);
            }
        }
        Term::ImproperList(elems, tail) => {
            buf.put_u8(tag::LIST);
            buf.put_u32(len_u32("list", elems.len())?);
            for e in elems {
                encode_inner(e, buf)?;
            }
            encode_inner(tail, buf)?;
        }
        Term::Binary(data) => {
            buf.put_u8(tag::BINARY);
            buf.put_u32(len_u32("binary", data.len())?);
            buf.put_slice(data);
        }
        Term::BitBinary { data, bits } => {
            if data.is_empty() || !(1..=7).contains(bits) {
                return Err(EncodeError::BadBitCount(*bits));
            }
            buf.put_u8(tag::BIT_BINARY);
            buf.put_u32(len_u32("bitstring", data.len())?);
            buf.put_u8(*bits);
            buf.put_slice(data);
        }
        Term::Map(pairs) => {
            buf.put_u8(tag::MAP);
            buf.put_u32(len_u32("map", pairs.len())?);
            for (k, v) in pairs {
                encode_inner(k, buf)?;
                encode_inner(v, buf)?;
            }
        }
        Term::Export {
            module,
            function,
            arity,
        } => {
            buf.put_u8(tag::EXPORT);
            encode_atom(module, buf)?;
            encode_atom(function, buf)?;
            buf.put_u8(tag::SMALL_INTEGER);
            buf.put_u8(*arity);
        }
        Term::Pid(pid) => {
            buf.put_u8(tag::NEW_PID);
            encode_atom(&pid.node, buf)?;
            buf.put_u32(pid.id);
            buf.put_u32(pid.serial);
            buf.put_u32(pid.creation);
        }
        Term::Ref(r) => {
            if r.ids.is_empty() || r.ids.len() > 5 {
                return Err(EncodeError::BadRefLength(r.ids.len()));
            }
            buf.put_u8(tag::NEWER_REFERENCE);
            buf.put_u16(r.ids.len() as u16);
            encode_atom(&r.node, buf)?;
            buf.put_u32(r.creation);
            for id in &r.ids {
                buf.put_u32(*id);
            }
        }
        Term::Port(port) => match u32::try_from(port.id) {
            Ok(id) => {
                buf.put_u8(tag::NEW_PORT);
                encode_atom(&port.node, buf)?;
                buf.put_u32(id);
                buf.put_u32(port.creation);
            }
            Err(_) => {
                buf.put_u8(tag::V4_PORT);
                encode_atom(&port.node, buf)?;
                buf.put_u64(port.id);
                buf.put_u32(port.creation);
            }
        },
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a versioned term. Returns the term and bytes consumed, version
/// byte included.
pub fn decode(input: &[u8]) -> Result<(Term, usize), DecodeError> {
    let mut r = Reader::new(input);
    let magic = r.u8()?;
    if magic != VERSION_MAGIC {
        return Err(DecodeError {
            offset: 0,
            reason: DecodeReason::BadVersion(magic),
        });
    }
    let term = r.term(0)?;
    Ok((term, r.pos))
}

/// Decode a term without a version byte.
pub fn decode_body(input: &[u8]) -> Result<(Term, usize), DecodeError> {
    let mut r = Reader::new(input);
    let term = r.term(0)?;
    Ok((term, r.pos))
}

/// Decode a versioned term that must span the whole buffer.
pub fn decode_exact(input: &[u8]) -> Result<Term, DecodeError> {
    let (term, used) = decode(input)?;
    if used != input.len() {
        return Err(DecodeError {
            offset: used,
            reason: DecodeReason::TrailingBytes(input.len() - used),
        });
    }
    Ok(term)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn fail<T>(&self, offset: usize, reason: DecodeReason) -> Result<T, DecodeError> {
        Err(DecodeError { offset, reason })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return self.fail(self.pos, DecodeReason::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reject a count of items that could not possibly fit in what remains.
    fn check_len(&self, count: usize, min_each: usize) -> Result<(), DecodeError> {
        match count.checked_mul(min_each) {
            Some(need) if need <= self.remaining() => Ok(()),
            _ => self.fail(self.pos, DecodeReason::LengthMismatch(count)),
        }
    }

    fn atom_text(&mut self, len: usize, utf8: bool) -> Result<Atom, DecodeError> {
        let start = self.pos;
        let raw = self.take(len)?;
        let text = if utf8 {
            match std::str::from_utf8(raw) {
                Ok(s) => s.to_string(),
                Err(_) => return self.fail(start, DecodeReason::InvalidUtf8),
            }
        } else {
            raw.iter().map(|b| *b as char).collect()
        };
        if text.chars().count() > MAX_ATOM_CHARS {
            return self.fail(start, DecodeReason::AtomTooLong);
        }
        Ok(Atom::from(text))
    }

    fn atom(&mut self) -> Result<Atom, DecodeError> {
        let at = self.pos;
        match self.u8()? {
            tag::ATOM => {
                let len = self.u16()? as usize;
                self.atom_text(len, false)
            }
            tag::SMALL_ATOM => {
                let len = self.u8()? as usize;
                self.atom_text(len, false)
            }
            tag::ATOM_UTF8 => {
                let len = self.u16()? as usize;
                self.atom_text(len, true)
            }
            tag::SMALL_ATOM_UTF8 => {
                let len = self.u8()? as usize;
                self.atom_text(len, true)
            }
            other => self.fail(at, DecodeReason::UnexpectedTag(other)),
        }
    }

    fn big(&mut self, len: usize) -> Result<Term, DecodeError> {
        if len > MAX_BIG_BYTES {
            return self.fail(self.pos, DecodeReason::BigTooLarge(len));
        }
        let sign_at = self.pos;
        let sign = self.u8()?;
        if sign > 1 {
            return self.fail(sign_at, DecodeReason::BadSign(sign));
        }
        let bytes = self.take(len)?;
        let mut value = BigInteger::from(0);
        for b in bytes.iter().rev() {
            value *= BigInteger::from(256u32);
            value += BigInteger::from(*b);
        }
        if sign == 1 {
            value = -value;
        }
        Ok(Term::big(value))
    }

    fn float_text(&mut self) -> Result<Term, DecodeError> {
        let at = self.pos;
        let raw = self.take(31)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end])
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map(Term::Float)
            .map_or_else(|| self.fail(at, DecodeReason::BadFloat), Ok)
    }

    fn elements(&mut self, count: usize, depth: usize) -> Result<Vec<Term>, DecodeError> {
        self.check_len(count, 1)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.term(depth + 1)?);
        }
        Ok(out)
    }

    fn reference(&mut self, words: usize, wide_creation: bool) -> Result<Term, DecodeError> {
        let at = self.pos;
        if words == 0 || words > 5 {
            return self.fail(at, DecodeReason::BadRefLength(words));
        }
        let node = self.atom()?;
        let creation = if wide_creation {
            self.u32()?
        } else {
            self.u8()? as u32
        };
        let mut ids = Vec::with_capacity(words);
        for _ in 0..words {
            ids.push(self.u32()?);
        }
        Ok(Term::Ref(Reference {
            node,
            ids,
            creation,
        }))
    }

    fn term(&mut self, depth: usize) -> Result<Term, DecodeError> {
        let at = self.pos;
        if depth > MAX_DEPTH {
            return self.fail(at, DecodeReason::TooDeep);
        }
        let t = self.u8()?;
        let term = match t {
            tag::SMALL_INTEGER => Term::Integer(self.u8()? as i64),
            tag::INTEGER => Term::Integer(self.u32()? as i32 as i64),
            tag::NEW_FLOAT => {
                let v = f64::from_bits(self.u64()?);
                if !v.is_finite() {
                    return self.fail(at, DecodeReason::BadFloat);
                }
                Term::Float(v)
            }
            tag::FLOAT => self.float_text()?,
            tag::ATOM | tag::SMALL_ATOM | tag::ATOM_UTF8 | tag::SMALL_ATOM_UTF8 => {
                self.pos = at;
                Term::Atom(self.atom()?)
            }
            tag::SMALL_TUPLE => {
                let n = self.u8()? as usize;
                Term::Tuple(self.elements(n, depth)?)
            }
            tag::LARGE_TUPLE => {
                let n = self.u32()? as usize;
                Term::Tuple(self.elements(n, depth)?)
            }
            tag::NIL => Term::nil(),
            tag::STRING => {
                let n = self.u16()? as usize;
                let bytes = self.take(n)?;
                Term::List(bytes.iter().map(|b| Term::Integer(*b as i64)).collect())
            }
            tag::LIST => {
                let n = self.u32()? as usize;
                let elems = self.elements(n, depth)?;
                let tail = self.term(depth + 1)?;
                Term::improper_list(elems, tail)
            }
            tag::BINARY => {
                let n = self.u32()? as usize;
                Term::Binary(self.take(n)?.to_vec())
            }
            tag::BIT_BINARY => {
                let n = self.u32()? as usize;
                let bits_at = self.pos;
                let bits = self.u8()?;
                if n == 0 || !(1..=8).contains(&bits) {
                    return self.fail(bits_at, DecodeReason::BadBitCount(bits));
                }
                let data = self.take(n)?.to_vec();
                if bits == 8 {
                    Term::Binary(data)
                } else {
                    Term::BitBinary { data, bits }
                }
            }
            tag::SMALL_BIG => {
                let n = self.u8()? as usize;
                self.big(n)?
            }
            tag::LARGE_BIG => {
                let n = self.u32()? as usize;
                self.big(n)?
            }
            tag::MAP => {
                let n = self.u32()? as usize;
                self.check_len(n, 2)?;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let k = self.term(depth + 1)?;
                    let v = self.term(depth + 1)?;
                    pairs.push((k, v));
                }
                Term::Map(pairs)
            }
            tag::EXPORT => {
                let module = self.atom()?;
                let function = self.atom()?;
                let arity_at = self.pos;
                match self.term(depth + 1)? {
                    Term::Integer(a) if (0..=255).contains(&a) => Term::Export {
                        module,
                        function,
                        arity: a as u8,
                    },
                    _ => return self.fail(arity_at, DecodeReason::BadArity),
                }
            }
            tag::NEW_PID | tag::PID => {
                let node = self.atom()?;
                let id = self.u32()?;
                let serial = self.u32()?;
                let creation = if t == tag::NEW_PID {
                    self.u32()?
                } else {
                    self.u8()? as u32
                };
                Term::Pid(Pid {
                    node,
                    id,
                    serial,
                    creation,
                })
            }
            tag::NEW_PORT | tag::PORT | tag::V4_PORT => {
                let node = self.atom()?;
                let id = if t == tag::V4_PORT {
                    self.u64()?
                } else {
                    self.u32()? as u64
                };
                let creation = if t == tag::PORT {
                    self.u8()? as u32
                } else {
                    self.u32()?
                };
                Term::Port(Port { node, id, creation })
            }
            tag::NEWER_REFERENCE => {
                let words = self.u16()? as usize;
                self.reference(words, true)?
            }
            tag::NEW_REFERENCE => {
                let words = self.u16()? as usize;
                self.reference(words, false)?
            }
            tag::REFERENCE => {
                let node = self.atom()?;
                let id = self.u32()?;
                let creation = self.u8()? as u32;
                Term::Ref(Reference {
                    node,
                    ids: vec![id],
                    creation,
                })
            }
            other => return self.fail(at, DecodeReason::UnknownTag(other)),
        };
        Ok(term)
    }
}
