//! The communicator ("com") abstraction: transport semantics the rest of
//! the core consumes without caring whether the underlying transport is
//! TCP, UDP (with its virtual-socket demultiplexer), a UNIX-domain socket,
//! or TLS wrapped around any of the above.
//!
//! Per the design notes, this is modeled as a tagged enum of concrete
//! variants rather than a `dyn` trait object hierarchy: the capability set
//! is fixed and known ahead of time, and a flat `match` is both cheaper and
//! easier to reason about than dynamic dispatch through a deep inheritance
//! chain.

mod tcp;
mod tls;
mod udp;
mod unix;

pub use tcp::TcpCom;
pub use tls::{HandshakeOutcome, TlsCom, TlsMode};
pub use udp::UdpCom;
pub use unix::UnixCom;

use std::os::unix::io::RawFd;

use crate::error::ComError;
use crate::poller::{Mask, Poller};

/// Protocol family at L3, used only for diagnostics and `shortname()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Proto {
    Ip4,
    Ip6,
    Unix,
}

/// Protocol family at L4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
}

/// Read/write flags mirroring the `MSG_PEEK`/`MSG_NOSIGNAL` semantics the
/// core relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RwFlags {
    pub peek: bool,
    pub no_sigpipe: bool,
}

impl RwFlags {
    pub const PLAIN: RwFlags = RwFlags { peek: false, no_sigpipe: true };
    pub const PEEK: RwFlags = RwFlags { peek: true, no_sigpipe: true };
}

/// One-shot forced-I/O flags, held on [`crate::hostcx::HostCx::forced`]. Per
/// the open design question, these are strictly single-shot per round and
/// are cleared by [`ForcedIo::take_all`] at the top of
/// [`crate::proxy::BaseProxy`]'s per-CX service step rather than persisting
/// across rounds: `read_reset`/`write_reset` force that direction to run
/// this round regardless of poller readiness; `write_on_read` forces a
/// write in the same round a read happened; `read_on_write` forces a read
/// on the next round a write happened in (this round's read already ran
/// before the write, so it cannot retroactively happen sooner).
#[derive(Debug, Clone, Copy, Default)]
pub struct ForcedIo {
    pub read_reset: bool,
    pub write_reset: bool,
    pub read_on_write: bool,
    pub write_on_read: bool,
}

impl ForcedIo {
    /// Clear every flag, returning the values they held. Called once per CX
    /// per round so forced flags can never leak into a later round.
    pub fn take_all(&mut self) -> ForcedIo {
        std::mem::take(self)
    }
}

/// A transport communicator. Tagged union over the four supported
/// transports; `Tls` wraps another `Com` of any variant (including another
/// `Tls`, though that is never exercised in practice).
pub enum Com {
    Tcp(TcpCom),
    Udp(UdpCom),
    Unix(UnixCom),
    Tls(Box<TlsCom>),
}

impl Com {
    pub fn new_tcp() -> Com {
        Com::Tcp(TcpCom::new())
    }

    pub fn new_udp() -> Com {
        Com::Udp(UdpCom::new())
    }

    pub fn new_unix() -> Com {
        Com::Unix(UnixCom::new())
    }

    pub fn wrap_tls(inner: Com, mode: TlsMode) -> Com {
        Com::Tls(Box::new(TlsCom::new(inner, mode)))
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        match self {
            Com::Tcp(c) => c.descriptor(),
            Com::Udp(c) => c.descriptor(),
            Com::Unix(c) => c.descriptor(),
            Com::Tls(c) => c.descriptor(),
        }
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<RawFd, ComError> {
        match self {
            Com::Tcp(c) => c.connect(host, port),
            Com::Udp(c) => c.connect(host, port),
            Com::Unix(c) => c.connect(host, port),
            Com::Tls(c) => c.connect(host, port),
        }
    }

    pub fn bind(&mut self, target: &str) -> Result<RawFd, ComError> {
        match self {
            Com::Tcp(c) => c.bind(target),
            Com::Udp(c) => c.bind(target),
            Com::Unix(c) => c.bind(target),
            Com::Tls(c) => c.bind(target),
        }
    }

    pub fn accept(&mut self, fd: RawFd) -> Result<(RawFd, Option<String>), ComError> {
        match self {
            Com::Tcp(c) => c.accept(fd),
            Com::Udp(c) => c.accept(fd),
            Com::Unix(c) => c.accept(fd),
            Com::Tls(c) => c.accept(fd),
        }
    }

    pub fn read(&mut self, fd: RawFd, buf: &mut [u8], flags: RwFlags) -> Result<usize, ComError> {
        match self {
            Com::Tcp(c) => c.read(fd, buf, flags),
            Com::Udp(c) => c.read(fd, buf, flags),
            Com::Unix(c) => c.read(fd, buf, flags),
            Com::Tls(c) => c.read(fd, buf, flags),
        }
    }

    pub fn write(&mut self, fd: RawFd, buf: &[u8], flags: RwFlags) -> Result<usize, ComError> {
        match self {
            Com::Tcp(c) => c.write(fd, buf, flags),
            Com::Udp(c) => c.write(fd, buf, flags),
            Com::Unix(c) => c.write(fd, buf, flags),
            Com::Tls(c) => c.write(fd, buf, flags),
        }
    }

    pub fn peek(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, ComError> {
        self.read(fd, buf, RwFlags::PEEK)
    }

    pub fn shutdown(&mut self, fd: RawFd) {
        match self {
            Com::Tcp(c) => c.shutdown(fd),
            Com::Udp(c) => c.shutdown(fd),
            Com::Unix(c) => c.shutdown(fd),
            Com::Tls(c) => c.shutdown(fd),
        }
    }

    pub fn close(&mut self, fd: RawFd) {
        match self {
            Com::Tcp(c) => c.close(fd),
            Com::Udp(c) => c.close(fd),
            Com::Unix(c) => c.close(fd),
            Com::Tls(c) => c.close(fd),
        }
    }

    pub fn readable(&self, fd: RawFd, poller: &Poller) -> bool {
        match self {
            Com::Tls(c) => c.readable(fd, poller),
            _ => poller.in_contains(fd),
        }
    }

    pub fn writable(&self, fd: RawFd, poller: &Poller) -> bool {
        match self {
            Com::Tls(c) => c.writable(fd, poller),
            _ => poller.out_contains(fd),
        }
    }

    pub fn set_monitor(&self, fd: RawFd, poller: &mut Poller, handler: crate::poller::HandlerId) -> Result<(), crate::error::PollerError> {
        poller.add(fd, Mask::READ, handler)
    }

    pub fn set_write_monitor(&self, fd: RawFd, poller: &mut Poller, handler: crate::poller::HandlerId) -> Result<(), crate::error::PollerError> {
        poller.add(fd, Mask::BOTH, handler)
    }

    pub fn change_monitor(&self, fd: RawFd, poller: &mut Poller, mask: Mask) -> Result<(), crate::error::PollerError> {
        poller.modify(fd, mask)
    }

    pub fn unset_monitor(&self, fd: RawFd, poller: &mut Poller) -> Result<(), crate::error::PollerError> {
        poller.del(fd)
    }

    pub fn rescan_read(&self, fd: RawFd, poller: &mut Poller) {
        poller.rescan_in(fd);
    }

    pub fn rescan_write(&self, fd: RawFd, poller: &mut Poller) {
        poller.rescan_out(fd);
    }

    /// Map a (possibly virtual) identifier to the real descriptor backing
    /// it. Identity for everything except UDP virtual flows.
    pub fn translate_socket(&self, virtual_fd: RawFd) -> RawFd {
        match self {
            Com::Udp(c) => c.translate_socket(virtual_fd),
            Com::Tls(c) => c.translate_socket(virtual_fd),
            _ => virtual_fd,
        }
    }

    pub fn l3_proto(&self) -> L3Proto {
        match self {
            Com::Tcp(c) => c.l3_proto(),
            Com::Udp(c) => c.l3_proto(),
            Com::Unix(c) => c.l3_proto(),
            Com::Tls(c) => c.l3_proto(),
        }
    }

    pub fn l4_proto(&self) -> L4Proto {
        match self {
            Com::Tcp(c) => c.l4_proto(),
            Com::Udp(c) => c.l4_proto(),
            Com::Unix(c) => c.l4_proto(),
            Com::Tls(c) => c.l4_proto(),
        }
    }

    pub fn shortname(&self) -> &'static str {
        match self {
            Com::Tcp(c) => c.shortname(),
            Com::Udp(c) => c.shortname(),
            Com::Unix(c) => c.shortname(),
            Com::Tls(c) => c.shortname(),
        }
    }

    /// A fresh, unconnected sibling communicator of the same variant and
    /// configuration as `self`. Used when a CX needs a peer-facing com built
    /// the same way as the client-facing one it mirrors (e.g. TLS-terminate
    /// on one side, originate fresh TLS on the other).
    pub fn replicate(&self) -> Com {
        match self {
            Com::Tcp(_) => Com::new_tcp(),
            Com::Udp(_) => Com::new_udp(),
            Com::Unix(_) => Com::new_unix(),
            Com::Tls(c) => Com::Tls(Box::new(c.replicate())),
        }
    }

    /// The com a freshly accepted connection gets, built from `self` (the
    /// listening com) and the descriptor `accept()` just handed back.
    ///
    /// TCP/UNIX: wraps the already-open fd directly (the listening com has
    /// nowhere to park one owned sibling per accept). UDP: a lightweight
    /// sibling sharing the real socket and flow table, since `fd` here is a
    /// demultiplexed virtual flow id, not a new descriptor. TLS is never
    /// the listening variant in this path -- a bound com is always plain
    /// TCP/UNIX/UDP, upgraded to TLS only after acceptance.
    ///
    /// # Safety
    /// For TCP/UNIX, `fd` must be the descriptor this same `accept()` call
    /// just returned, not yet wrapped or closed elsewhere.
    pub unsafe fn accepted_sibling(&self, fd: RawFd) -> Com {
        match self {
            Com::Tcp(_) => Com::Tcp(TcpCom::from_accepted(fd)),
            Com::Unix(_) => Com::Unix(UnixCom::from_accepted(fd)),
            Com::Udp(c) => Com::Udp(c.bind_to_flow(fd)),
            Com::Tls(_) => self.replicate(),
        }
    }

    /// The peer address a UDP flow (virtual or connected) talks to, if
    /// known. `None` for every other transport.
    pub fn flow_peer(&self, fd: RawFd) -> Option<std::net::SocketAddr> {
        match self {
            Com::Udp(c) => c.flow_peer(fd),
            _ => None,
        }
    }

    pub fn as_tls(&self) -> Option<&TlsCom> {
        match self {
            Com::Tls(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_tls_mut(&mut self) -> Option<&mut TlsCom> {
        match self {
            Com::Tls(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_io_take_all_clears_flags() {
        let mut f = ForcedIo { read_reset: true, write_on_read: true, ..Default::default() };
        let taken = f.take_all();
        assert!(taken.read_reset);
        assert!(!f.read_reset);
        assert!(!f.write_on_read);
    }

    #[test]
    fn replicate_preserves_variant() {
        let tcp = Com::new_tcp();
        assert_eq!(tcp.shortname(), "tcp");
        assert_eq!(tcp.replicate().shortname(), "tcp");

        let unx = Com::new_unix();
        assert_eq!(unx.shortname(), "ux");
    }
}
