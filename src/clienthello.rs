//! Manual ClientHello parsing for the pre-peek path.
//!
//! The first bytes of an incoming client connection are non-destructively
//! peeked (never consumed) and walked by hand to pull out the fields needed
//! to decide which certificate to mint *before* any real TLS library takes
//! ownership of the socket for the actual handshake. Handing this off to
//! `rustls::server::Acceptor` instead would work for SNI alone but would
//! consume the bytes, which the peek-first design here cannot afford.

const TLS_RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST_NAME: u8 = 0x00;

/// The handful of ClientHello fields the certificate factory and TLS
/// communicator care about. Anything else in the message is walked over
/// but not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    NotTlsHandshake,
    NotClientHello,
    Truncated,
}

/// Parse a ClientHello out of a buffer that starts at the first byte of a
/// TLS record. Returns `Truncated` rather than guessing when the buffer
/// ends mid-field, so the caller can peek a larger amount and retry.
pub fn parse(buf: &[u8]) -> Result<ClientHello, ParseError> {
    if buf.len() < 5 {
        return Err(ParseError::Truncated);
    }
    if buf[0] != TLS_RECORD_HANDSHAKE {
        return Err(ParseError::NotTlsHandshake);
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len.min(buf.len() - 5) {
        // fall through; we only need as much of the record as is present
    }
    let handshake = &buf[5..buf.len().min(5 + record_len)];

    if handshake.len() < 4 {
        return Err(ParseError::Truncated);
    }
    if handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(ParseError::NotClientHello);
    }

    let hs_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let body = &handshake[4..handshake.len().min(4 + hs_len)];

    if body.len() < 34 {
        return Err(ParseError::Truncated);
    }

    let legacy_version = u16::from_be_bytes([body[0], body[1]]);
    let mut pos = 34; // protocol version (2) + random (32)

    if pos >= body.len() {
        return Err(ParseError::Truncated);
    }
    let session_id_len = body[pos] as usize;
    pos += 1;
    if pos + session_id_len > body.len() {
        return Err(ParseError::Truncated);
    }
    let session_id = body[pos..pos + session_id_len].to_vec();
    pos += session_id_len;

    if pos + 2 > body.len() {
        return Err(ParseError::Truncated);
    }
    let cipher_suites_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    if pos + cipher_suites_len > body.len() {
        return Err(ParseError::Truncated);
    }
    let cipher_suites: Vec<u16> = body[pos..pos + cipher_suites_len]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    pos += cipher_suites_len;

    if pos >= body.len() {
        return Err(ParseError::Truncated);
    }
    let compression_len = body[pos] as usize;
    pos += 1;
    if pos + compression_len > body.len() {
        return Err(ParseError::Truncated);
    }
    let compression_methods = body[pos..pos + compression_len].to_vec();
    pos += compression_len;

    let mut server_name = None;
    if pos + 2 <= body.len() {
        let extensions_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
        pos += 2;
        let extensions_end = (pos + extensions_len).min(body.len());

        while pos + 4 <= extensions_end {
            let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
            let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
            pos += 4;
            if pos + ext_len > extensions_end {
                break;
            }

            if ext_type == EXTENSION_SERVER_NAME {
                server_name = parse_server_name_extension(&body[pos..pos + ext_len]);
            }

            pos += ext_len;
        }
    }

    Ok(ClientHello { legacy_version, session_id, cipher_suites, compression_methods, server_name })
}

fn parse_server_name_extension(ext: &[u8]) -> Option<String> {
    // server_name_list_length(2) + server_name_type(1) + host_name_length(2) + host_name
    if ext.len() < 5 {
        return None;
    }
    let name_type = ext[2];
    if name_type != SERVER_NAME_TYPE_HOST_NAME {
        return None;
    }
    let name_len = u16::from_be_bytes([ext[3], ext[4]]) as usize;
    if ext.len() < 5 + name_len {
        return None;
    }
    String::from_utf8(ext[5..5 + name_len].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes()); // legacy version TLS1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // empty session id
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&0x1301u16.to_be_bytes());
        body.push(1); // compression methods length
        body.push(0); // null compression

        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let mut sni_ext = Vec::new();
            let name_bytes = name.as_bytes();
            sni_ext.extend_from_slice(&((name_bytes.len() + 3) as u16).to_be_bytes());
            sni_ext.push(0x00);
            sni_ext.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
            sni_ext.extend_from_slice(name_bytes);

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&sni_ext);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(TLS_RECORD_HANDSHAKE);
        record.extend_from_slice(&0x0301u16.to_be_bytes());
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn rejects_non_handshake_record() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\n"), Err(ParseError::NotTlsHandshake));
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert_eq!(parse(&[0x16, 0x03, 0x01]), Err(ParseError::Truncated));
    }

    #[test]
    fn extracts_sni_from_well_formed_client_hello() {
        let record = build_client_hello(Some("example.com"));
        let hello = parse(&record).expect("parses");
        assert_eq!(hello.server_name.as_deref(), Some("example.com"));
        assert_eq!(hello.cipher_suites, vec![0x1301]);
    }

    #[test]
    fn absent_sni_parses_to_none() {
        let record = build_client_hello(None);
        let hello = parse(&record).expect("parses");
        assert_eq!(hello.server_name, None);
    }

    #[test]
    fn parse_tolerates_extra_trailing_bytes_after_record() {
        let mut record = build_client_hello(Some("trailing.example"));
        record.extend_from_slice(&[0xaa; 16]);
        let hello = parse(&record).expect("parses despite trailing garbage");
        assert_eq!(hello.server_name.as_deref(), Some("trailing.example"));
    }
}
