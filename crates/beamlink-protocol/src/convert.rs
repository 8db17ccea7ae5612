//! Typed extraction from decoded terms.
//!
//! Integer targets are range-checked against the decoded value first; the
//! narrower Rust value is only built once the check has passed.

use malachite::Integer as BigInteger;

use crate::etf;
use crate::term::{Atom, Pid, Reference, Term};
use crate::ProtocolError;

/// A decoded integer that does not fit the requested type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value {value} out of range for {target}")]
pub struct RangeError {
    pub value: String,
    pub target: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TermError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: String,
    },
}

impl TermError {
    fn mismatch(expected: &'static str, found: &Term) -> Self {
        TermError::Type {
            expected,
            found: found.to_string(),
        }
    }
}

/// Conversion from a decoded term into a Rust value.
pub trait FromTerm: Sized {
    fn from_term(term: &Term) -> Result<Self, TermError>;
}

macro_rules! int_from_term {
    ($($ty:ty),*) => {$(
        impl FromTerm for $ty {
            fn from_term(term: &Term) -> Result<Self, TermError> {
                match term {
                    Term::Integer(v) => <$ty>::try_from(*v).map_err(|_| {
                        TermError::Range(RangeError {
                            value: v.to_string(),
                            target: stringify!($ty),
                        })
                    }),
                    Term::BigInt(v) => big_into::<$ty>(v, stringify!($ty)),
                    other => Err(TermError::mismatch("integer", other)),
                }
            }
        }
    )*};
}

int_from_term!(u8, u16, u32, u64, usize, i8, i16, i32, i64);

/// Bignums only ever fit `u64`; everything else is out of range.
fn big_into<T: TryFrom<u64>>(v: &BigInteger, target: &'static str) -> Result<T, TermError> {
    u64::try_from(v)
        .ok()
        .and_then(|wide| T::try_from(wide).ok())
        .ok_or_else(|| {
            TermError::Range(RangeError {
                value: v.to_string(),
                target,
            })
        })
}

impl FromTerm for bool {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::Atom(a) if a == "true" => Ok(true),
            Term::Atom(a) if a == "false" => Ok(false),
            other => Err(TermError::mismatch("boolean", other)),
        }
    }
}

impl FromTerm for f64 {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::Float(v) => Ok(*v),
            other => Err(TermError::mismatch("float", other)),
        }
    }
}

impl FromTerm for Atom {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::Atom(a) => Ok(a.clone()),
            other => Err(TermError::mismatch("atom", other)),
        }
    }
}

/// Accepts a binary, a character list or an atom.
impl FromTerm for String {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::Binary(data) => String::from_utf8(data.clone())
                .map_err(|_| TermError::mismatch("utf-8 binary", term)),
            Term::Atom(a) => Ok(a.as_str().to_string()),
            Term::List(elems) => elems
                .iter()
                .map(|e| match e {
                    Term::Integer(c) => u32::try_from(*c).ok().and_then(char::from_u32),
                    _ => None,
                })
                .collect::<Option<String>>()
                .ok_or_else(|| TermError::mismatch("string", term)),
            other => Err(TermError::mismatch("string", other)),
        }
    }
}

impl FromTerm for Pid {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::Pid(p) => Ok(p.clone()),
            other => Err(TermError::mismatch("pid", other)),
        }
    }
}

impl FromTerm for Reference {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::Ref(r) => Ok(r.clone()),
            other => Err(TermError::mismatch("reference", other)),
        }
    }
}

impl FromTerm for Term {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        Ok(term.clone())
    }
}

impl<T: FromTerm> FromTerm for Vec<T> {
    fn from_term(term: &Term) -> Result<Self, TermError> {
        match term {
            Term::List(elems) => elems.iter().map(T::from_term).collect(),
            other => Err(TermError::mismatch("list", other)),
        }
    }
}

impl<T: FromTerm> FromTerm for Option<T> {
    /// `undefined` maps to `None`.
    fn from_term(term: &Term) -> Result<Self, TermError> {
        if term.is_atom("undefined") {
            return Ok(None);
        }
        T::from_term(term).map(Some)
    }
}

/// Decode a versioned term spanning the whole buffer and extract `T`.
pub fn decode_as<T: FromTerm>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let term = etf::decode_exact(bytes)?;
    Ok(T::from_term(&term)?)
}
