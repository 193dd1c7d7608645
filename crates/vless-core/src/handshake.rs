//! VLESS request header decoding.
//!
//! Wire layout of the first inbound chunk:
//!
//! ```text
//! [1B version][16B uuid][1B addon len][addon ...][1B command][2B port BE][1B addr type][addr ...][payload ...]
//! ```
//!
//! The server answers with `[version, 0]` in front of the first downlink chunk.
//! The header must arrive in a single chunk; a header split across two
//! WebSocket frames is rejected as truncated.

use crate::cursor::ByteCursor;
use crate::error::{RelayError, RelayResult};
use std::net::{Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// Smallest possible header: version, uuid, addon len, command, port, type, 1-byte domain length.
pub const MIN_HEADER_LEN: usize = 24;

pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x02;
pub const ATYP_IPV6: u8 = 0x03;

/// The only UDP destination port accepted (DNS).
pub const DNS_PORT: u16 = 53;

/// Decoded VLESS request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u8,
    pub host: String,
    pub port: u16,
    pub is_udp: bool,
    /// Index into the parsed buffer where the client payload begins.
    pub payload_offset: usize,
}

impl HandshakeRequest {
    /// Two-byte response: echoed version, status 0.
    pub fn response_header(&self) -> [u8; 2] {
        [self.version, 0]
    }

    pub fn network(&self) -> &'static str {
        if self.is_udp {
            "udp"
        } else {
            "tcp"
        }
    }
}

/// Parse and authenticate a VLESS header from the first inbound chunk.
///
/// Every failure, including truncation, is reported as [`RelayError::Protocol`].
pub fn parse_handshake(buf: &[u8], identity: &Uuid) -> RelayResult<HandshakeRequest> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(RelayError::Protocol("invalid data".into()));
    }
    let mut cursor = ByteCursor::new(buf);
    decode(&mut cursor, identity).map_err(|e| match e {
        RelayError::OutOfBounds { .. } => RelayError::Protocol(format!("truncated header: {e}")),
        other => other,
    })
}

fn decode(cursor: &mut ByteCursor<'_>, identity: &Uuid) -> RelayResult<HandshakeRequest> {
    let version = cursor.read_u8()?;

    if cursor.read_bytes(16)? != identity.as_bytes() {
        return Err(RelayError::Protocol("invalid identity".into()));
    }

    // Addon block (protobuf options); unused.
    let addon_len = cursor.read_u8()? as usize;
    cursor.skip(addon_len)?;

    let is_udp = match cursor.read_u8()? {
        CMD_TCP => false,
        CMD_UDP => true,
        cmd => {
            return Err(RelayError::Protocol(format!(
                "unsupported command: {cmd}"
            )))
        }
    };

    let port = cursor.read_u16_be()?;

    let host = match cursor.read_u8()? {
        ATYP_IPV4 => {
            let b = cursor.read_bytes(4)?;
            Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string()
        }
        ATYP_DOMAIN => {
            let len = cursor.read_u8()? as usize;
            let raw = cursor.read_bytes(len)?;
            std::str::from_utf8(raw)
                .map_err(|_| RelayError::Protocol("domain is not valid UTF-8".into()))?
                .to_string()
        }
        ATYP_IPV6 => {
            let b = cursor.read_bytes(16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            format_ipv6_groups(&Ipv6Addr::from(octets))
        }
        atyp => {
            return Err(RelayError::Protocol(format!(
                "unsupported address type: {atyp}"
            )))
        }
    };

    if host.is_empty() {
        return Err(RelayError::Protocol("empty address".into()));
    }

    Ok(HandshakeRequest {
        version,
        host,
        port,
        is_udp,
        payload_offset: cursor.offset(),
    })
}

/// Eight uncompressed lowercase hex groups, e.g. `2001:db8:0:0:0:0:0:1`.
fn format_ipv6_groups(addr: &Ipv6Addr) -> String {
    addr.segments()
        .iter()
        .map(|seg| format!("{seg:x}"))
        .collect::<Vec<_>>()
        .join(":")
}
