//! TLS communicator: wraps another [`crate::com::Com`] and drives a
//! `rustls` connection state machine over it by hand (read/write the raw
//! TLS record stream through the inner com, feed it to `rustls`, pull
//! plaintext back out) rather than handing the socket to an async
//! acceptor, since the pre-peeked ClientHello has to pick the certificate
//! before `rustls` ever sees a byte.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::clienthello::{self, ClientHello};
use crate::com::{Com, L3Proto, L4Proto, RwFlags};
use crate::error::{ComError, TlsComError};
use crate::poller::Poller;

/// Which end of the handshake this communicator plays.
pub enum TlsMode {
    /// Terminates TLS as a server, choosing its certificate from the
    /// pre-peeked ClientHello's SNI.
    Server { config: Arc<ServerConfig> },
    /// Originates TLS as a client, connecting onward to the real server.
    Client { server_name: String, config: Arc<ClientConfig> },
}

pub enum HandshakeOutcome {
    Pending,
    Done,
}

enum State {
    /// Server mode only: still peeking for the ClientHello before a
    /// `ServerConnection` has even been constructed.
    AwaitingClientHello,
    Handshaking(Connection),
    Established(Connection),
}

pub struct TlsCom {
    inner: Com,
    mode_tag: ModeTag,
    server_config: Option<Arc<ServerConfig>>,
    client_config: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
    state: State,
    peeked_hello: Option<ClientHello>,
}

enum ModeTag {
    Server,
    Client,
}

impl TlsCom {
    pub fn new(inner: Com, mode: TlsMode) -> Self {
        match mode {
            TlsMode::Server { config } => Self {
                inner,
                mode_tag: ModeTag::Server,
                server_config: Some(config),
                client_config: None,
                server_name: None,
                state: State::AwaitingClientHello,
                peeked_hello: None,
            },
            TlsMode::Client { server_name, config } => Self {
                inner,
                mode_tag: ModeTag::Client,
                server_config: None,
                client_config: Some(config),
                server_name: Some(server_name),
                state: State::AwaitingClientHello,
                peeked_hello: None,
            },
        }
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.inner.descriptor()
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<RawFd, ComError> {
        let fd = self.inner.connect(host, port)?;
        if let ModeTag::Client = self.mode_tag {
            self.start_client_handshake()?;
        }
        Ok(fd)
    }

    pub fn bind(&mut self, target: &str) -> Result<RawFd, ComError> {
        self.inner.bind(target)
    }

    pub fn accept(&mut self, fd: RawFd) -> Result<(RawFd, Option<String>), ComError> {
        self.inner.accept(fd)
    }

    fn start_client_handshake(&mut self) -> Result<(), ComError> {
        let config = self.client_config.clone().ok_or(ComError::Tls("client config missing".into()))?;
        let name = self.server_name.clone().ok_or(ComError::Tls("server name missing".into()))?;
        let server_name: rustls::ServerName = name.as_str().try_into().map_err(|_| ComError::Tls("invalid server name".into()))?;
        let conn = ClientConnection::new(config, server_name).map_err(|e| ComError::Tls(e.to_string()))?;
        self.state = State::Handshaking(Connection::Client(conn));
        Ok(())
    }

    /// Peek the inner com for a ClientHello, select the server certificate
    /// via `sni`, and construct the `ServerConnection`. Returns the parsed
    /// hello so the caller (the certificate factory lookup site) can see
    /// the extracted SNI without re-parsing.
    pub fn peek_client_hello(&mut self, fd: RawFd, peek_size: usize) -> Result<Option<&ClientHello>, TlsComError> {
        if self.peeked_hello.is_some() {
            return Ok(self.peeked_hello.as_ref());
        }

        let mut buf = vec![0u8; peek_size];
        let n = match self.inner.read(fd, &mut buf, RwFlags::PEEK) {
            Ok(n) => n,
            Err(ComError::WouldBlock) => return Ok(None),
            Err(e) => return Err(TlsComError::Com(e)),
        };

        match clienthello::parse(&buf[..n]) {
            Ok(hello) => {
                self.peeked_hello = Some(hello);
                Ok(self.peeked_hello.as_ref())
            }
            Err(clienthello::ParseError::Truncated) => Ok(None),
            Err(_) => Err(TlsComError::Handshake("not a TLS ClientHello".into())),
        }
    }

    /// Build the `ServerConnection` now that a certificate config has been
    /// selected for the peeked SNI (the certificate factory lookup happens
    /// at the call site; this just wires the resulting config in).
    pub fn start_server_handshake(&mut self, config: Arc<ServerConfig>) -> Result<(), TlsComError> {
        let conn = ServerConnection::new(config).map_err(|e| TlsComError::Handshake(e.to_string()))?;
        self.state = State::Handshaking(Connection::Server(conn));
        Ok(())
    }

    /// Pump the handshake: read any pending TLS records from the inner com
    /// into the connection, write any the connection wants to send, and
    /// report whether the handshake has completed.
    pub fn drive_handshake(&mut self, fd: RawFd) -> Result<HandshakeOutcome, TlsComError> {
        let conn = match &mut self.state {
            State::Handshaking(c) => c,
            State::Established(_) => return Ok(HandshakeOutcome::Done),
            State::AwaitingClientHello => return Ok(HandshakeOutcome::Pending),
        };

        if conn.wants_read() {
            let mut raw = InnerSocket { com: &mut self.inner, fd };
            match conn.read_tls(&mut raw) {
                Ok(0) => return Err(TlsComError::Handshake("peer closed during handshake".into())),
                Ok(_) => {
                    conn.process_new_packets().map_err(|e| TlsComError::Handshake(e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(TlsComError::Handshake(e.to_string())),
            }
        }

        if conn.wants_write() {
            let mut raw = InnerSocket { com: &mut self.inner, fd };
            match conn.write_tls(&mut raw) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(TlsComError::Handshake(e.to_string())),
            }
        }

        if !conn.is_handshaking() {
            let finished = std::mem::replace(&mut self.state, State::AwaitingClientHello);
            if let State::Handshaking(c) = finished {
                self.state = State::Established(c);
            }
            Ok(HandshakeOutcome::Done)
        } else {
            Ok(HandshakeOutcome::Pending)
        }
    }

    pub fn read(&mut self, fd: RawFd, buf: &mut [u8], flags: RwFlags) -> Result<usize, ComError> {
        if flags.peek {
            return self.inner.read(fd, buf, flags);
        }
        let conn = match &mut self.state {
            State::Established(c) => c,
            _ => return Err(ComError::WouldBlock),
        };

        {
            let mut raw = InnerSocket { com: &mut self.inner, fd };
            match conn.read_tls(&mut raw) {
                Ok(0) => return Err(ComError::Eof),
                Ok(_) => {
                    conn.process_new_packets().map_err(|e| ComError::Tls(e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(ComError::from(e)),
            }
        }

        use std::io::Read;
        match conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ComError::WouldBlock),
            Err(e) => Err(ComError::from(e)),
        }
    }

    pub fn write(&mut self, fd: RawFd, buf: &[u8], _flags: RwFlags) -> Result<usize, ComError> {
        let conn = match &mut self.state {
            State::Established(c) => c,
            _ => return Err(ComError::WouldBlock),
        };

        use std::io::Write as _;
        let n = conn.writer().write(buf).map_err(ComError::from)?;

        let mut raw = InnerSocket { com: &mut self.inner, fd };
        while conn.wants_write() {
            match conn.write_tls(&mut raw) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ComError::from(e)),
            }
        }
        Ok(n)
    }

    pub fn shutdown(&mut self, fd: RawFd) {
        if let State::Established(conn) = &mut self.state {
            conn.send_close_notify();
            let mut raw = InnerSocket { com: &mut self.inner, fd };
            let _ = conn.write_tls(&mut raw);
        }
        self.inner.shutdown(fd);
    }

    pub fn close(&mut self, fd: RawFd) {
        self.inner.close(fd);
    }

    pub fn readable(&self, fd: RawFd, poller: &Poller) -> bool {
        poller.in_contains(fd)
    }

    pub fn writable(&self, fd: RawFd, poller: &Poller) -> bool {
        poller.out_contains(fd)
    }

    pub fn translate_socket(&self, virtual_fd: RawFd) -> RawFd {
        self.inner.translate_socket(virtual_fd)
    }

    pub fn l3_proto(&self) -> L3Proto {
        self.inner.l3_proto()
    }

    pub fn l4_proto(&self) -> L4Proto {
        L4Proto::Tcp
    }

    pub fn shortname(&self) -> &'static str {
        "tls"
    }

    pub fn replicate(&self) -> TlsCom {
        match (&self.mode_tag, &self.server_config, &self.client_config, &self.server_name) {
            (ModeTag::Server, Some(cfg), _, _) => {
                TlsCom::new(self.inner.replicate(), TlsMode::Server { config: cfg.clone() })
            }
            (ModeTag::Client, _, Some(cfg), Some(name)) => {
                TlsCom::new(self.inner.replicate(), TlsMode::Client { server_name: name.clone(), config: cfg.clone() })
            }
            _ => TlsCom::new(self.inner.replicate(), TlsMode::Server { config: empty_server_config() }),
        }
    }
}

/// Adapts the inner `Com`'s raw read/write to the `std::io::Read`/`Write`
/// interface `rustls::Connection::{read_tls,write_tls}` expects.
struct InnerSocket<'a> {
    com: &'a mut Com,
    fd: RawFd,
}

impl<'a> io::Read for InnerSocket<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.com.read(self.fd, buf, RwFlags::PLAIN) {
            Ok(n) => Ok(n),
            Err(ComError::WouldBlock) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Err(ComError::Eof) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl<'a> io::Write for InnerSocket<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.com.write(self.fd, buf, RwFlags::PLAIN) {
            Ok(n) => Ok(n),
            Err(ComError::WouldBlock) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build a trust store from a directory of PEM root CAs, used by
/// [`TlsMode::Client`] configs when verifying the real upstream server.
pub fn trust_store_from_pem_dir(dir: &std::path::Path) -> io::Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pem") {
            continue;
        }
        let mut reader = io::BufReader::new(std::fs::File::open(&path)?);
        let ders = rustls_pemfile::certs(&mut reader)?;
        for der in ders {
            let _ = store.add(&rustls::Certificate(der));
        }
    }
    Ok(store)
}

fn empty_server_config() -> Arc<ServerConfig> {
    Arc::new(
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertsResolver)),
    )
}

struct NoCertsResolver;

impl rustls::server::ResolvesServerCert for NoCertsResolver {
    fn resolve(&self, _client_hello: rustls::server::ClientHello) -> Option<Arc<rustls::sign::CertifiedKey>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tls_com_has_no_descriptor() {
        let inner = Com::new_tcp();
        let com = TlsCom::new(inner, TlsMode::Server { config: empty_server_config() });
        assert!(com.descriptor().is_none());
        assert_eq!(com.shortname(), "tls");
    }
}
