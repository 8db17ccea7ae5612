//! beamlink node -- a hidden distribution peer with mailboxes and remote calls.
//!
//! Re-exports the node, mailbox and RPC types so the binary and integration
//! tests can drive a connection end to end.

pub mod backend;
pub mod code;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod handshake;
pub mod mailbox;
pub mod node;
pub mod rpc;

pub use backend::Backend;
pub use error::NodeError;
pub use mailbox::{Dest, Mailbox, ReceiveError};
pub use node::{Node, StatusEvent};
pub use rpc::{RpcClient, RpcError, RpcFuture, RpcResult};

use std::path::PathBuf;

use beamlink_protocol::Term;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Parse a command-line argument into a term: integer, float, `"quoted"`
/// binary, `'quoted'` atom, otherwise a bare atom.
pub fn parse_term_arg(arg: &str) -> Term {
    if let Ok(i) = arg.parse::<i64>() {
        return Term::Integer(i);
    }
    if arg.contains('.') {
        if let Ok(f) = arg.parse::<f64>() {
            if f.is_finite() {
                return Term::Float(f);
            }
        }
    }
    if let Some(inner) = quoted(arg, '"') {
        return Term::binary(inner.as_bytes());
    }
    if let Some(inner) = quoted(arg, '\'') {
        return Term::atom(inner);
    }
    Term::atom(arg)
}

fn quoted(arg: &str, quote: char) -> Option<&str> {
    arg.strip_prefix(quote)?.strip_suffix(quote)
}

/// JSON view of a term for `--json` output. Lossy: tuples and lists both
/// become arrays, identifiers and big integers become their printed form.
pub fn term_to_json(term: &Term) -> serde_json::Value {
    use serde_json::Value;
    match term {
        Term::Atom(a) => match a.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "undefined" => Value::Null,
            other => Value::String(other.to_string()),
        },
        Term::Integer(i) => Value::from(*i),
        Term::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Term::Binary(data) => match std::str::from_utf8(data) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Array(data.iter().map(|b| Value::from(*b)).collect()),
        },
        Term::Tuple(elems) | Term::List(elems) => {
            Value::Array(elems.iter().map(term_to_json).collect())
        }
        Term::Map(pairs) => {
            let mut object = serde_json::Map::new();
            for (k, v) in pairs {
                let key = match k {
                    Term::Atom(a) => a.as_str().to_string(),
                    Term::Binary(data) => String::from_utf8_lossy(data).into_owned(),
                    other => other.to_string(),
                };
                object.insert(key, term_to_json(v));
            }
            Value::Object(object)
        }
        other => Value::String(other.to_string()),
    }
}
