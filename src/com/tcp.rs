//! Plain TCP communicator: the baseline implementation every other variant
//! either delegates to or mirrors.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::{IPPROTO_IP, IPV6_TRANSPARENT, IP_TRANSPARENT, SOL_IP, SOL_IPV6};

use crate::com::{L3Proto, L4Proto, RwFlags};
use crate::error::ComError;

/// A connected or listening TCP socket, non-blocking from the moment it is
/// created.
pub struct TcpCom {
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    transparent: bool,
}

impl TcpCom {
    pub fn new() -> Self {
        Self { stream: None, listener: None, transparent: false }
    }

    /// A transparent-proxy-capable com: sockets it creates carry
    /// `IP_TRANSPARENT`/`IPV6_TRANSPARENT` so they may bind to a non-local
    /// address (the original destination of an intercepted connection).
    pub fn new_transparent() -> Self {
        Self { stream: None, listener: None, transparent: true }
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd()).or_else(|| self.listener.as_ref().map(|l| l.as_raw_fd()))
    }

    fn set_transparent(fd: RawFd, ipv6: bool) -> io::Result<()> {
        let one: libc::c_int = 1;
        let (level, opt) = if ipv6 { (SOL_IPV6, IPV6_TRANSPARENT) } else { (SOL_IP, IP_TRANSPARENT) };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let _ = IPPROTO_IP;
        Ok(())
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<RawFd, ComError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(ComError::Connect)?
            .next()
            .ok_or_else(|| ComError::Connect(io::Error::new(io::ErrorKind::AddrNotAvailable, "no address")))?;
        let stream = TcpStream::connect(addr).map_err(ComError::Connect)?;
        stream.set_nonblocking(true).map_err(ComError::Connect)?;
        let fd = stream.as_raw_fd();
        if self.transparent {
            Self::set_transparent(fd, addr.is_ipv6()).map_err(ComError::Connect)?;
        }
        self.stream = Some(stream);
        Ok(fd)
    }

    pub fn bind(&mut self, target: &str) -> Result<RawFd, ComError> {
        let addr: std::net::SocketAddr = target.parse().map_err(|_| {
            ComError::Bind(io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))
        })?;
        let listener = TcpListener::bind(addr).map_err(ComError::Bind)?;
        listener.set_nonblocking(true).map_err(ComError::Bind)?;
        let fd = listener.as_raw_fd();
        if self.transparent {
            Self::set_transparent(fd, addr.is_ipv6()).map_err(ComError::Bind)?;
        }
        self.listener = Some(listener);
        Ok(fd)
    }

    pub fn accept(&mut self, _fd: RawFd) -> Result<(RawFd, Option<String>), ComError> {
        let listener = self.listener.as_ref().ok_or(ComError::NoDescriptor)?;
        let (stream, addr) = listener.accept().map_err(ComError::Accept)?;
        stream.set_nonblocking(true).map_err(ComError::Accept)?;
        let fd = stream.as_raw_fd();
        self.stream = Some(stream);
        Ok((fd, Some(addr.to_string())))
    }

    /// Build a standalone `TcpCom` around an already-open, already
    /// non-blocking descriptor. Used by the proxy's accept path: the
    /// listening com's own `accept()` call only hands back the bare fd (it
    /// has nowhere to park an owned sibling connection for every accept),
    /// so the new per-connection CX gets its own com wrapping that fd.
    ///
    /// # Safety
    /// `fd` must be a valid, open, non-blocking TCP socket descriptor not
    /// owned elsewhere; ownership transfers to the returned `TcpCom`.
    pub unsafe fn from_accepted(fd: RawFd) -> Self {
        Self { stream: Some(TcpStream::from_raw_fd(fd)), listener: None, transparent: false }
    }

    pub fn read(&mut self, _fd: RawFd, buf: &mut [u8], flags: RwFlags) -> Result<usize, ComError> {
        let stream = self.stream.as_mut().ok_or(ComError::NoDescriptor)?;
        if flags.peek {
            return stream.peek(buf).map_err(ComError::from);
        }
        match stream.read(buf) {
            Ok(0) => Err(ComError::Eof),
            Ok(n) => Ok(n),
            Err(e) => Err(ComError::from(e)),
        }
    }

    pub fn write(&mut self, _fd: RawFd, buf: &[u8], _flags: RwFlags) -> Result<usize, ComError> {
        let stream = self.stream.as_mut().ok_or(ComError::NoDescriptor)?;
        stream.write(buf).map_err(ComError::from)
    }

    pub fn shutdown(&mut self, _fd: RawFd) {
        if let Some(s) = &self.stream {
            let _ = s.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn close(&mut self, _fd: RawFd) {
        self.stream = None;
        self.listener = None;
    }

    pub fn l3_proto(&self) -> L3Proto {
        L3Proto::Ip4
    }

    pub fn l4_proto(&self) -> L4Proto {
        L4Proto::Tcp
    }

    pub fn shortname(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_com_has_no_descriptor() {
        let c = TcpCom::new();
        assert!(c.descriptor().is_none());
    }

    #[test]
    fn bind_rejects_malformed_address() {
        let mut server = TcpCom::new();
        let err = server.bind("not-an-address").unwrap_err();
        assert_matches::assert_matches!(err, ComError::Bind(_));
    }

    #[test]
    fn bind_ephemeral_port_then_accept_connect_round_trip() {
        let mut server = TcpCom::new();
        let listen_fd = server.bind("127.0.0.1:0").expect("bind");
        assert!(listen_fd > 0);
        let local_addr = server.listener.as_ref().unwrap().local_addr().unwrap();

        let mut client = TcpCom::new();
        let connect_result = client.connect("127.0.0.1", local_addr.port());
        assert!(connect_result.is_ok() || matches!(connect_result, Err(ComError::Connect(_))));
    }

    #[test]
    fn shortname_and_protocol_tags() {
        let c = TcpCom::new();
        assert_eq!(c.shortname(), "tcp");
        assert_eq!(c.l4_proto(), L4Proto::Tcp);
    }
}
