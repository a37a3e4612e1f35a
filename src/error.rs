//! Typed errors for every fallible component, in the `failure::Fail` style
//! the rest of this crate follows: one enum per module, `#[fail(display
//! = ...)]` messages, `From` impls at the boundaries that need them.

use std::io;

use failure::Fail;

#[derive(Debug, Fail)]
pub enum PollerError {
    #[fail(display = "failed to register descriptor with the OS readiness facility: {}", _0)]
    Register(io::Error),
    #[fail(display = "failed to deregister descriptor: {}", _0)]
    Deregister(io::Error),
    #[fail(display = "poll wait failed: {}", _0)]
    Wait(io::Error),
}

impl From<io::Error> for PollerError {
    fn from(e: io::Error) -> Self {
        PollerError::Wait(e)
    }
}

#[derive(Debug, Fail)]
pub enum ComError {
    #[fail(display = "connect failed: {}", _0)]
    Connect(io::Error),
    #[fail(display = "bind failed: {}", _0)]
    Bind(io::Error),
    #[fail(display = "accept failed: {}", _0)]
    Accept(io::Error),
    #[fail(display = "operation would block")]
    WouldBlock,
    #[fail(display = "peer shut down the connection")]
    Eof,
    #[fail(display = "TLS error: {}", _0)]
    Tls(String),
    #[fail(display = "com has no underlying descriptor")]
    NoDescriptor,
}

impl From<io::Error> for ComError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            ComError::WouldBlock
        } else {
            ComError::Connect(e)
        }
    }
}

#[derive(Debug, Fail)]
pub enum HostCxError {
    #[fail(display = "com error: {}", _0)]
    Com(ComError),
    #[fail(display = "CX is paused, waiting for its peer's com to become ready")]
    WaitingForPeerCom,
    #[fail(display = "CX is bottlenecked by its peer's write buffer")]
    Bottlenecked,
}

impl From<ComError> for HostCxError {
    fn from(e: ComError) -> Self {
        HostCxError::Com(e)
    }
}

#[derive(Debug, Fail)]
pub enum ProxyError {
    #[fail(display = "accept attempted without holding the per-fd accept mutex")]
    UnguardedAccept,
    #[fail(display = "sub-proxy handler fence mismatch (expected {:#x}, got {:#x})", expected, got)]
    FenceMismatch { expected: u32, got: u32 },
    #[fail(display = "host context error: {}", _0)]
    HostCx(HostCxError),
    #[fail(display = "poller error: {}", _0)]
    Poller(PollerError),
}

impl From<HostCxError> for ProxyError {
    fn from(e: HostCxError) -> Self {
        ProxyError::HostCx(e)
    }
}

impl From<PollerError> for ProxyError {
    fn from(e: PollerError) -> Self {
        ProxyError::Poller(e)
    }
}

#[derive(Debug, Fail)]
pub enum CertStoreError {
    #[fail(display = "failed to load CA certificate/key from {}: {}", _0, _1)]
    LoadCa(String, String),
    #[fail(display = "failed to load trust store from {}: {}", _0, _1)]
    LoadTrustStore(String, String),
    #[fail(display = "failed to parse original certificate: {}", _0)]
    ParseOriginal(String),
    #[fail(display = "certificate signing failed: {}", _0)]
    Sign(String),
}

#[derive(Debug, Fail)]
pub enum TlsComError {
    #[fail(display = "{}", _0)]
    Com(ComError),
    #[fail(display = "no certificate available for SNI {:?}", _0)]
    NoCert(Option<String>),
    #[fail(display = "TLS handshake failed: {}", _0)]
    Handshake(String),
    #[fail(display = "peer com is not established yet")]
    PeerNotReady,
}

impl From<ComError> for TlsComError {
    fn from(e: ComError) -> Self {
        TlsComError::Com(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_populated() {
        let e = ProxyError::FenceMismatch { expected: 0xcaba1a, got: 0x1 };
        assert_eq!(format!("{}", e), "sub-proxy handler fence mismatch (expected 0xcaba1a, got 0x1)");
    }

    #[test]
    fn would_block_is_mapped_from_io_error() {
        let io_err = io::Error::from(io::ErrorKind::WouldBlock);
        let e: ComError = io_err.into();
        assert_matches::assert_matches!(e, ComError::WouldBlock);
    }
}
