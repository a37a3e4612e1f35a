//! UNIX-domain communicator.
//!
//! Extends the plain-TCP pattern rather than duplicating it: a UNIX socket
//! behaves exactly like a TCP one for the purposes of this core (no
//! transparent-proxy option, no virtual demux), the only real difference
//! being the address family and connect/bind targets being filesystem
//! paths instead of host:port pairs.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use crate::com::{L3Proto, L4Proto, RwFlags};
use crate::error::ComError;

pub struct UnixCom {
    stream: Option<UnixStream>,
    listener: Option<UnixListener>,
}

impl UnixCom {
    pub fn new() -> Self {
        Self { stream: None, listener: None }
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd()).or_else(|| self.listener.as_ref().map(|l| l.as_raw_fd()))
    }

    /// `host` is interpreted as a filesystem path; `port` is ignored (kept
    /// only so the signature matches the other variants' `connect`).
    pub fn connect(&mut self, host: &str, _port: u16) -> Result<RawFd, ComError> {
        let stream = UnixStream::connect(host).map_err(ComError::Connect)?;
        stream.set_nonblocking(true).map_err(ComError::Connect)?;
        let fd = stream.as_raw_fd();
        self.stream = Some(stream);
        Ok(fd)
    }

    pub fn bind(&mut self, target: &str) -> Result<RawFd, ComError> {
        let _ = std::fs::remove_file(target);
        let listener = UnixListener::bind(target).map_err(ComError::Bind)?;
        listener.set_nonblocking(true).map_err(ComError::Bind)?;
        let fd = listener.as_raw_fd();
        self.listener = Some(listener);
        Ok(fd)
    }

    pub fn accept(&mut self, _fd: RawFd) -> Result<(RawFd, Option<String>), ComError> {
        let listener = self.listener.as_ref().ok_or(ComError::NoDescriptor)?;
        let (stream, _addr) = listener.accept().map_err(ComError::Accept)?;
        stream.set_nonblocking(true).map_err(ComError::Accept)?;
        let fd = stream.as_raw_fd();
        self.stream = Some(stream);
        Ok((fd, None))
    }

    /// See [`crate::com::tcp::TcpCom::from_accepted`]; same contract for a
    /// UNIX-domain descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open, non-blocking UNIX stream descriptor not
    /// owned elsewhere; ownership transfers to the returned `UnixCom`.
    pub unsafe fn from_accepted(fd: RawFd) -> Self {
        Self { stream: Some(UnixStream::from_raw_fd(fd)), listener: None }
    }

    pub fn read(&mut self, _fd: RawFd, buf: &mut [u8], flags: RwFlags) -> Result<usize, ComError> {
        let stream = self.stream.as_mut().ok_or(ComError::NoDescriptor)?;
        if flags.peek {
            // UNIX stream sockets have no MSG_PEEK-via-std helper; the
            // clienthello pre-peek path is TCP/TLS-only so this is never
            // exercised in practice.
            return Err(ComError::WouldBlock);
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
        L3Proto::Unix
    }

    pub fn l4_proto(&self) -> L4Proto {
        L4Proto::Tcp
    }

    pub fn shortname(&self) -> &'static str {
        "ux"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_com_has_no_descriptor() {
        let c = UnixCom::new();
        assert!(c.descriptor().is_none());
    }

    #[test]
    fn bind_connect_accept_round_trip_over_a_temp_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let path_str = path.to_str().unwrap();

        let mut server = UnixCom::new();
        server.bind(path_str).expect("bind");

        let mut client = UnixCom::new();
        client.connect(path_str, 0).expect("connect");

        let (peer_fd, addr) = server.accept(0).expect("accept");
        assert!(peer_fd > 0);
        assert!(addr.is_none());
    }
}
