//! Term model -- one closed sum type over every value the peer can send.
//!
//! Integers and lists are kept in canonical form so that structural
//! equality matches the peer's notion of equality:
//!   - any integer that fits in `i64` is `Term::Integer`
//!   - an improper list never has a list as its tail

use std::fmt;

use malachite::Integer as BigInteger;

// ============================================================================
// Identifiers
// ============================================================================

/// An atom. Stored as UTF-8; at most 255 characters on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(String);

impl Atom {
    pub fn new(name: impl Into<String>) -> Self {
        Atom(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the atom prints without quotes.
    fn is_bare(&self) -> bool {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@')
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom(s.to_string())
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Self {
        Atom(s)
    }
}

impl AsRef<str> for Atom {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Atom {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Atom {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bare() {
            return f.write_str(&self.0);
        }
        f.write_str("'")?;
        for c in self.0.chars() {
            match c {
                '\'' => f.write_str("\\'")?,
                '\\' => f.write_str("\\\\")?,
                c => write!(f, "{c}")?,
            }
        }
        f.write_str("'")
    }
}

/// Process identifier. `creation` distinguishes incarnations of a node name,
/// so equal (node, id, serial) with different creation are different pids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pid {
    pub node: Atom,
    pub id: u32,
    pub serial: u32,
    pub creation: u32,
}

impl Pid {
    pub fn new(node: impl Into<Atom>, id: u32, serial: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            serial,
            creation,
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

/// Reference. The peer emits between one and five id words.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub node: Atom,
    pub ids: Vec<u32>,
    pub creation: u32,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#Ref<{}", self.node)?;
        for id in self.ids.iter().rev() {
            write!(f, ".{id}")?;
        }
        f.write_str(">")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    pub node: Atom,
    pub id: u64,
    pub creation: u32,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#Port<{}.{}>", self.node, self.id)
    }
}

// ============================================================================
// Term
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Atom(Atom),
    Integer(i64),
    /// Only for values outside the `i64` range.
    BigInt(BigInteger),
    Float(f64),
    Tuple(Vec<Term>),
    /// Proper list; the empty list is nil.
    List(Vec<Term>),
    /// Non-empty list whose tail is not a list.
    ImproperList(Vec<Term>, Box<Term>),
    Binary(Vec<u8>),
    /// Bitstring whose last byte holds `bits` (1..=7) significant bits.
    BitBinary { data: Vec<u8>, bits: u8 },
    Map(Vec<(Term, Term)>),
    Export {
        module: Atom,
        function: Atom,
        arity: u8,
    },
    Pid(Pid),
    Ref(Reference),
    Port(Port),
}

impl Term {
    pub fn atom(name: &str) -> Term {
        Term::Atom(Atom::from(name))
    }

    pub fn nil() -> Term {
        Term::List(Vec::new())
    }

    pub fn tuple(elements: Vec<Term>) -> Term {
        Term::Tuple(elements)
    }

    pub fn list(elements: Vec<Term>) -> Term {
        Term::List(elements)
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Term {
        Term::Binary(data.into())
    }

    /// A character list, the peer's classic string representation.
    pub fn charlist(s: &str) -> Term {
        Term::List(s.chars().map(|c| Term::Integer(c as i64)).collect())
    }

    pub fn boolean(value: bool) -> Term {
        Term::atom(if value { "true" } else { "false" })
    }

    /// Build `[e1, e2, ... | tail]`, flattening list tails.
    pub fn improper_list(mut elements: Vec<Term>, tail: Term) -> Term {
        match tail {
            Term::List(rest) => {
                elements.extend(rest);
                Term::List(elements)
            }
            Term::ImproperList(rest, tail) => {
                elements.extend(rest);
                Term::ImproperList(elements, tail)
            }
            tail if elements.is_empty() => tail,
            tail => Term::ImproperList(elements, Box::new(tail)),
        }
    }

    /// Wrap an arbitrary precision integer, demoting to `Integer` when it fits.
    pub fn big(value: BigInteger) -> Term {
        match i64::try_from(&value) {
            Ok(small) => Term::Integer(small),
            Err(_) => Term::BigInt(value),
        }
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Term::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(elems) => Some(elems),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(elems) => Some(elems),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<&Pid> {
        match self {
            Term::Pid(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_atom(&self, name: &str) -> bool {
        matches!(self, Term::Atom(a) if a.as_str() == name)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Term::List(elems) if elems.is_empty())
    }

    /// Elements of a tuple with the given tag atom and arity, if it matches.
    pub fn tagged(&self, tag: &str, arity: usize) -> Option<&[Term]> {
        match self {
            Term::Tuple(elems) if elems.len() == arity && elems[0].is_atom(tag) => Some(elems),
            _ => None,
        }
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Term::Atom(_) => "atom",
            Term::Integer(_) | Term::BigInt(_) => "integer",
            Term::Float(_) => "float",
            Term::Tuple(_) => "tuple",
            Term::List(_) | Term::ImproperList(..) => "list",
            Term::Binary(_) => "binary",
            Term::BitBinary { .. } => "bitstring",
            Term::Map(_) => "map",
            Term::Export { .. } => "fun",
            Term::Pid(_) => "pid",
            Term::Ref(_) => "reference",
            Term::Port(_) => "port",
        }
    }
}

macro_rules! small_int_into_term {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Term {
            fn from(v: $ty) -> Self {
                Term::Integer(v as i64)
            }
        }
    )*};
}

small_int_into_term!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Term {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(small) => Term::Integer(small),
            Err(_) => Term::BigInt(BigInteger::from(v)),
        }
    }
}

impl From<usize> for Term {
    fn from(v: usize) -> Self {
        Term::from(v as u64)
    }
}

impl From<BigInteger> for Term {
    fn from(v: BigInteger) -> Self {
        Term::big(v)
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Self {
        Term::Float(v)
    }
}

impl From<bool> for Term {
    fn from(v: bool) -> Self {
        Term::boolean(v)
    }
}

impl From<Atom> for Term {
    fn from(a: Atom) -> Self {
        Term::Atom(a)
    }
}

impl From<Pid> for Term {
    fn from(p: Pid) -> Self {
        Term::Pid(p)
    }
}

impl From<Reference> for Term {
    fn from(r: Reference) -> Self {
        Term::Ref(r)
    }
}

impl From<Port> for Term {
    fn from(p: Port) -> Self {
        Term::Port(p)
    }
}

impl From<Vec<Term>> for Term {
    fn from(elems: Vec<Term>) -> Self {
        Term::List(elems)
    }
}

// ============================================================================
// Display -- literal syntax of the peer runtime
// ============================================================================

fn write_seq(f: &mut fmt::Formatter<'_>, elems: &[Term]) -> fmt::Result {
    for (i, e) in elems.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}

fn is_printable(data: &[u8]) -> bool {
    !data.is_empty() && data.iter().all(|b| (0x20..0x7f).contains(b) && *b != b'"')
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Atom(a) => write!(f, "{a}"),
            Term::Integer(v) => write!(f, "{v}"),
            Term::BigInt(v) => write!(f, "{v}"),
            Term::Float(v) => write!(f, "{v:?}"),
            Term::Tuple(elems) => {
                f.write_str("{")?;
                write_seq(f, elems)?;
                f.write_str("}")
            }
            Term::List(elems) => {
                f.write_str("[")?;
                write_seq(f, elems)?;
                f.write_str("]")
            }
            Term::ImproperList(elems, tail) => {
                f.write_str("[")?;
                write_seq(f, elems)?;
                write!(f, "|{tail}]")
            }
            Term::Binary(data) if is_printable(data) => {
                write!(f, "<<\"{}\">>", String::from_utf8_lossy(data))
            }
            Term::Binary(data) => {
                f.write_str("<<")?;
                for (i, b) in data.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{b}")?;
                }
                f.write_str(">>")
            }
            Term::BitBinary { data, bits } => {
                f.write_str("<<")?;
                let last = data.len().saturating_sub(1);
                for (i, b) in data.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    if i == last {
                        write!(f, "{}:{bits}", b >> (8 - bits))?;
                    } else {
                        write!(f, "{b}")?;
                    }
                }
                f.write_str(">>")
            }
            Term::Map(pairs) => {
                f.write_str("#{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k} => {v}")?;
                }
                f.write_str("}")
            }
            Term::Export {
                module,
                function,
                arity,
            } => write!(f, "fun {module}:{function}/{arity}"),
            Term::Pid(p) => write!(f, "{p}"),
            Term::Ref(r) => write!(f, "{r}"),
            Term::Port(p) => write!(f, "{p}"),
        }
    }
}
