//! Node discovery service requests and responses.
//!
//! Requests carry a 2-byte length prefix. The service answers once and
//! closes the socket, so responses are parsed from the complete read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

pub const PORT_PLEASE2_REQ: u8 = 122;
pub const PORT2_RESP: u8 = 119;
pub const NAMES_REQ: u8 = 110;

/// Node type byte for a regular node.
pub const NODE_TYPE_NORMAL: u8 = 77;
/// Node type byte for a hidden node.
pub const NODE_TYPE_HIDDEN: u8 = 72;

/// A registered node as reported by `PORT2_RESP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub port: u16,
    pub node_type: u8,
    pub protocol: u8,
    pub highest_version: u16,
    pub lowest_version: u16,
    pub name: String,
    pub extra: Vec<u8>,
}

fn request(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    buf.freeze()
}

/// Port lookup for the alive part of a node name.
pub fn encode_port_please(alive: &str) -> Bytes {
    let mut body = Vec::with_capacity(1 + alive.len());
    body.push(PORT_PLEASE2_REQ);
    body.extend_from_slice(alive.as_bytes());
    request(&body)
}

pub fn encode_names_req() -> Bytes {
    request(&[NAMES_REQ])
}

fn truncated(what: &str) -> ProtocolError {
    ProtocolError::Malformed(format!("discovery response truncated in {what}"))
}

/// `None` when the service does not know the name.
pub fn decode_port2_resp(resp: &[u8]) -> Result<Option<NodeEntry>, ProtocolError> {
    let mut buf = resp;
    if buf.remaining() < 2 {
        return Err(truncated("header"));
    }
    let tag = buf.get_u8();
    if tag != PORT2_RESP {
        return Err(ProtocolError::Malformed(format!(
            "expected PORT2_RESP, got tag {tag}"
        )));
    }
    if buf.get_u8() != 0 {
        return Ok(None);
    }
    if buf.remaining() < 10 {
        return Err(truncated("entry"));
    }
    let port = buf.get_u16();
    let node_type = buf.get_u8();
    let protocol = buf.get_u8();
    let highest_version = buf.get_u16();
    let lowest_version = buf.get_u16();
    let nlen = buf.get_u16() as usize;
    if buf.remaining() < nlen {
        return Err(truncated("name"));
    }
    let name = String::from_utf8_lossy(&buf[..nlen]).into_owned();
    buf.advance(nlen);
    // Extra is optional on the wire from older services
    let extra = if buf.remaining() >= 2 {
        let elen = buf.get_u16() as usize;
        if buf.remaining() < elen {
            return Err(truncated("extra"));
        }
        buf[..elen].to_vec()
    } else {
        Vec::new()
    };
    Ok(Some(NodeEntry {
        port,
        node_type,
        protocol,
        highest_version,
        lowest_version,
        name,
        extra,
    }))
}

/// Response to a port lookup. Used by in-process discovery services.
pub fn encode_port2_resp(entry: Option<&NodeEntry>) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(PORT2_RESP);
    match entry {
        None => buf.put_u8(1),
        Some(e) => {
            buf.put_u8(0);
            buf.put_u16(e.port);
            buf.put_u8(e.node_type);
            buf.put_u8(e.protocol);
            buf.put_u16(e.highest_version);
            buf.put_u16(e.lowest_version);
            buf.put_u16(e.name.len() as u16);
            buf.put_slice(e.name.as_bytes());
            buf.put_u16(e.extra.len() as u16);
            buf.put_slice(&e.extra);
        }
    }
    buf.freeze()
}

/// Parse a `NAMES_REQ` response: the service's own port followed by
/// lines of `name <alive> at port <port>`.
pub fn parse_names(resp: &[u8]) -> Result<(u32, Vec<(String, u16)>), ProtocolError> {
    let mut buf = resp;
    if buf.remaining() < 4 {
        return Err(truncated("names header"));
    }
    let service_port = buf.get_u32();
    let text = String::from_utf8_lossy(buf);
    let mut nodes = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parsed = line
            .strip_prefix("name ")
            .and_then(|rest| rest.rsplit_once(" at port "))
            .and_then(|(name, port)| port.trim().parse::<u16>().ok().map(|p| (name.to_string(), p)));
        match parsed {
            Some(entry) => nodes.push(entry),
            None => {
                return Err(ProtocolError::Malformed(format!(
                    "unrecognised names line {line:?}"
                )))
            }
        }
    }
    Ok((service_port, nodes))
}

pub fn encode_names_resp(service_port: u32, nodes: &[(String, u16)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(service_port);
    for (name, port) in nodes {
        buf.put_slice(format!("name {name} at port {port}\n").as_bytes());
    }
    buf.freeze()
}
