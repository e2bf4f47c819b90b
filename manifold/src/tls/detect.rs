//! TLS ClientHello inspection.
//!
//! Parses the initial bytes of a connection to extract the SNI hostname
//! and offered ALPN protocols, without consuming the stream or performing
//! a handshake. The pass-through branch routes on the result and forwards
//! the untouched ciphertext to the backend.

use bytes::Buf;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsParseError {
    #[error("Invalid TLS record")]
    InvalidRecord,
    #[error("Not a ClientHello")]
    NotClientHello,
    #[error("Protocol error")]
    ProtocolError,
}

/// Fields extracted from a ClientHello.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    /// Server name, lowercased, trailing dot trimmed
    pub sni: Option<String>,
    /// Offered ALPN protocols in client preference order
    pub alpn: Option<Vec<String>>,
}

/// Number of bytes needed for the full first TLS record, once the 5-byte
/// record header is available.
pub fn record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    Some(5 + u16::from_be_bytes([buf[3], buf[4]]) as usize)
}

/// Parses the beginning of a TCP stream as a TLS ClientHello.
///
/// Returns `Ok(Some(info))` on success, `Ok(None)` if the buffer does not
/// yet hold the complete record, or an error if the bytes are not a
/// ClientHello at all.
pub fn parse_client_hello(buf: &[u8]) -> Result<Option<ClientHelloInfo>, TlsParseError> {
    // TLS record header (5 bytes)
    if buf.len() < 5 {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    let content_type = cursor.get_u8();
    let _version = cursor.get_u16();
    let length = cursor.get_u16() as usize;

    // ContentType::Handshake is 22
    if content_type != 22 {
        return Err(TlsParseError::InvalidRecord);
    }
    if cursor.remaining() < length {
        return Ok(None);
    }

    // Limit scope to the record body
    let mut reader = Cursor::new(&buf[5..5 + length]);

    // Handshake header (4 bytes)
    if reader.remaining() < 4 {
        return Err(TlsParseError::ProtocolError);
    }
    let handshake_type = reader.get_u8();
    let _handshake_len = read_u24(&mut reader);

    // HandshakeType::ClientHello is 1
    if handshake_type != 1 {
        return Err(TlsParseError::NotClientHello);
    }

    // Client version (2) + random (32)
    if reader.remaining() < 34 {
        return Err(TlsParseError::ProtocolError);
    }
    reader.advance(34);

    // Session ID
    if reader.remaining() < 1 {
        return Err(TlsParseError::ProtocolError);
    }
    let session_id_len = reader.get_u8() as usize;
    if reader.remaining() < session_id_len {
        return Err(TlsParseError::ProtocolError);
    }
    reader.advance(session_id_len);

    // Cipher suites
    if reader.remaining() < 2 {
        return Err(TlsParseError::ProtocolError);
    }
    let cipher_suites_len = reader.get_u16() as usize;
    if reader.remaining() < cipher_suites_len {
        return Err(TlsParseError::ProtocolError);
    }
    reader.advance(cipher_suites_len);

    // Compression methods
    if reader.remaining() < 1 {
        return Err(TlsParseError::ProtocolError);
    }
    let compression_len = reader.get_u8() as usize;
    if reader.remaining() < compression_len {
        return Err(TlsParseError::ProtocolError);
    }
    reader.advance(compression_len);

    // Extensions are absent in minimal TLS 1.0 hellos; nothing to extract.
    if reader.remaining() < 2 {
        return Ok(Some(ClientHelloInfo::default()));
    }
    let extensions_len = reader.get_u16() as usize;
    if reader.remaining() < extensions_len {
        return Err(TlsParseError::ProtocolError);
    }

    let body = reader.get_ref();
    let start = reader.position() as usize;
    parse_extensions(&body[start..start + extensions_len])
}

fn parse_extensions(buf: &[u8]) -> Result<Option<ClientHelloInfo>, TlsParseError> {
    let mut info = ClientHelloInfo::default();
    let mut reader = Cursor::new(buf);

    while reader.remaining() >= 4 {
        let ext_type = reader.get_u16();
        let ext_len = reader.get_u16() as usize;
        if reader.remaining() < ext_len {
            break;
        }

        let start = reader.position() as usize;
        let body = &buf[start..start + ext_len];
        reader.advance(ext_len);

        match ext_type {
            // server_name (0)
            0x0000 => info.sni = parse_sni_extension(body),
            // application_layer_protocol_negotiation (16)
            0x0010 => info.alpn = parse_alpn_extension(body),
            _ => {}
        }
    }

    Ok(Some(info))
}

// server_name_list: u16 list length, then (u8 name_type, u16 length, name)
// entries. name_type 0 is host_name.
fn parse_sni_extension(body: &[u8]) -> Option<String> {
    let mut reader = Cursor::new(body);
    if reader.remaining() < 2 {
        return None;
    }
    let list_len = reader.get_u16() as usize;
    let mut remaining = list_len.min(reader.remaining());

    while remaining >= 3 {
        let name_type = reader.get_u8();
        let name_len = reader.get_u16() as usize;
        remaining = remaining.saturating_sub(3);
        if reader.remaining() < name_len || remaining < name_len {
            return None;
        }

        let start = reader.position() as usize;
        let name = &body[start..start + name_len];
        reader.advance(name_len);
        remaining -= name_len;

        if name_type == 0 {
            let name = std::str::from_utf8(name).ok()?;
            return Some(name.to_lowercase().trim_end_matches('.').to_string());
        }
    }

    None
}

// protocol_name_list: u16 list length, then (u8 length, name) entries.
fn parse_alpn_extension(body: &[u8]) -> Option<Vec<String>> {
    let mut reader = Cursor::new(body);
    if reader.remaining() < 2 {
        return None;
    }
    let list_len = reader.get_u16() as usize;
    let mut remaining = list_len.min(reader.remaining());

    let mut protocols = Vec::new();
    while remaining >= 1 {
        let proto_len = reader.get_u8() as usize;
        remaining -= 1;
        if reader.remaining() < proto_len || remaining < proto_len {
            break;
        }

        let start = reader.position() as usize;
        if let Ok(proto) = std::str::from_utf8(&body[start..start + proto_len]) {
            protocols.push(proto.to_string());
        }
        reader.advance(proto_len);
        remaining -= proto_len;
    }

    Some(protocols)
}

fn read_u24(cursor: &mut Cursor<&[u8]>) -> u32 {
    let b1 = cursor.get_u8() as u32;
    let b2 = cursor.get_u8() as u32;
    let b3 = cursor.get_u8() as u32;
    (b1 << 16) | (b2 << 8) | b3
}
