//! UDP communicator with a virtual-socket demultiplexer.
//!
//! A single real UDP socket serves many logical flows; each flow is given a
//! "virtual" descriptor so the rest of the core (which is written in terms
//! of one-fd-per-peer) can treat it like any other com. Virtual ids are
//! negative (their sign bit set), mirroring the `1UL << 31` marking the
//! original session-key scheme used to tell a synthesized flow id apart
//! from a real descriptor.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::com::{L3Proto, L4Proto, RwFlags};
use crate::error::ComError;
use crate::sockflow::session_key;

const VIRTUAL_BIT: i32 = 1 << 30;

fn set_transparent(fd: RawFd, ipv6: bool) -> io::Result<()> {
    let one: libc::c_int = 1;
    let (level, opt) = if ipv6 {
        (libc::SOL_IPV6, libc::IPV6_TRANSPARENT)
    } else {
        (libc::SOL_IP, libc::IP_TRANSPARENT)
    };
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
    Ok(())
}

fn set_recv_origdstaddr(fd: RawFd, ipv6: bool) -> io::Result<()> {
    let one: libc::c_int = 1;
    let (level, opt) = if ipv6 {
        (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR)
    } else {
        (libc::SOL_IP, libc::IP_RECVORIGDSTADDR)
    };
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
    Ok(())
}

struct Flow {
    peer: SocketAddr,
    inbox: std::collections::VecDeque<Vec<u8>>,
}

/// UDP communicator. When bound, one real socket serves every flow; `flows`
/// maps a virtual id to the peer address and its pending-datagram inbox.
/// The socket and flow table live behind `Arc`s so that
/// [`UdpCom::bind_to_flow`] can hand the proxy's accept path a lightweight
/// per-flow sibling com that shares both without re-binding a socket per
/// connection -- matching the single-listener-many-flows design UDP
/// transparent proxying requires.
pub struct UdpCom {
    socket: Option<Arc<UdpSocket>>,
    connected_peer: Option<SocketAddr>,
    flows: Arc<Mutex<HashMap<RawFd, Flow>>>,
    next_virtual: Arc<Mutex<i32>>,
    /// `Some(vfd)` identifies this instance as a per-flow sibling com bound
    /// to one demultiplexed flow; `None` means this is the listening
    /// instance that owns the real socket and demultiplexes `accept()`.
    own_flow: Option<RawFd>,
    transparent: bool,
}

impl UdpCom {
    pub fn new() -> Self {
        Self {
            socket: None,
            connected_peer: None,
            flows: Arc::new(Mutex::new(HashMap::new())),
            next_virtual: Arc::new(Mutex::new(VIRTUAL_BIT)),
            own_flow: None,
            transparent: false,
        }
    }

    /// A transparent-proxy-capable listening com: the bound socket carries
    /// `IP_TRANSPARENT`/`IPV6_TRANSPARENT` (so it may bind to a non-local
    /// original-destination address) and `IP_RECVORIGDSTADDR`/
    /// `IPV6_RECVORIGDSTADDR` (so a receiver thread can recover that
    /// original destination from ancillary control data per datagram).
    pub fn new_transparent() -> Self {
        Self {
            socket: None,
            connected_peer: None,
            flows: Arc::new(Mutex::new(HashMap::new())),
            next_virtual: Arc::new(Mutex::new(VIRTUAL_BIT)),
            own_flow: None,
            transparent: true,
        }
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.own_flow.or_else(|| self.socket.as_ref().map(|s| s.as_raw_fd()))
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<RawFd, ComError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(ComError::Connect)?;
        socket.set_nonblocking(true).map_err(ComError::Connect)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ComError::Connect(io::Error::new(io::ErrorKind::InvalidInput, "bad address")))?;
        socket.connect(addr).map_err(ComError::Connect)?;
        let fd = socket.as_raw_fd();
        self.connected_peer = Some(addr);
        self.socket = Some(Arc::new(socket));
        Ok(fd)
    }

    pub fn bind(&mut self, target: &str) -> Result<RawFd, ComError> {
        let socket = UdpSocket::bind(target).map_err(ComError::Bind)?;
        socket.set_nonblocking(true).map_err(ComError::Bind)?;
        let fd = socket.as_raw_fd();
        if self.transparent {
            let ipv6 = target.parse::<SocketAddr>().map(|a| a.is_ipv6()).unwrap_or(false);
            set_transparent(fd, ipv6).map_err(ComError::Bind)?;
            set_recv_origdstaddr(fd, ipv6).map_err(ComError::Bind)?;
        }
        self.socket = Some(Arc::new(socket));
        Ok(fd)
    }

    /// A lightweight sibling com bound to one already-demultiplexed flow,
    /// sharing this com's real socket and flow table by reference. Used by
    /// the proxy's accept path to give the newly accepted CX its own com
    /// without opening a second socket.
    pub fn bind_to_flow(&self, vfd: RawFd) -> UdpCom {
        UdpCom {
            socket: self.socket.clone(),
            connected_peer: None,
            flows: self.flows.clone(),
            next_virtual: self.next_virtual.clone(),
            own_flow: Some(vfd),
            transparent: self.transparent,
        }
    }

    /// UDP has no connection handshake; "accept" demultiplexes the next
    /// datagram on the real socket into a (possibly new) virtual flow and
    /// hands its virtual id back as if it were a freshly accepted peer.
    pub fn accept(&mut self, _fd: RawFd) -> Result<(RawFd, Option<String>), ComError> {
        let socket = self.socket.as_ref().ok_or(ComError::NoDescriptor)?;
        let mut buf = [0u8; 65536];
        let (n, peer) = socket.recv_from(&mut buf).map_err(ComError::from)?;

        let mut flows = self.flows.lock();
        let existing = flows.iter().find(|(_, f)| f.peer == peer).map(|(fd, _)| *fd);
        let vfd = match existing {
            Some(fd) => fd,
            None => {
                let mut next = self.next_virtual.lock();
                let id = *next;
                *next += 1;
                id
            }
        };
        let entry = flows.entry(vfd).or_insert_with(|| Flow { peer, inbox: Default::default() });
        entry.inbox.push_back(buf[..n].to_vec());
        Ok((vfd, Some(peer.to_string())))
    }

    pub fn read(&mut self, fd: RawFd, buf: &mut [u8], flags: RwFlags) -> Result<usize, ComError> {
        if self.is_virtual(fd) {
            let mut flows = self.flows.lock();
            let flow = flows.get_mut(&fd).ok_or(ComError::NoDescriptor)?;
            let datagram = if flags.peek {
                flow.inbox.front().cloned()
            } else {
                flow.inbox.pop_front()
            };
            return match datagram {
                Some(d) => {
                    let n = d.len().min(buf.len());
                    buf[..n].copy_from_slice(&d[..n]);
                    Ok(n)
                }
                None => Err(ComError::WouldBlock),
            };
        }

        let socket = self.socket.as_mut().ok_or(ComError::NoDescriptor)?;
        if flags.peek {
            return socket.peek(buf).map_err(ComError::from);
        }
        socket.recv(buf).map_err(ComError::from)
    }

    pub fn write(&mut self, fd: RawFd, buf: &[u8], _flags: RwFlags) -> Result<usize, ComError> {
        if self.is_virtual(fd) {
            let flows = self.flows.lock();
            let flow = flows.get(&fd).ok_or(ComError::NoDescriptor)?;
            let socket = self.socket.as_ref().ok_or(ComError::NoDescriptor)?;
            return socket.send_to(buf, flow.peer).map_err(ComError::from);
        }
        let socket = self.socket.as_mut().ok_or(ComError::NoDescriptor)?;
        socket.send(buf).map_err(ComError::from)
    }

    pub fn shutdown(&mut self, fd: RawFd) {
        self.close(fd);
    }

    pub fn close(&mut self, fd: RawFd) {
        if self.is_virtual(fd) {
            self.flows.lock().remove(&fd);
        } else {
            self.socket = None;
        }
    }

    fn is_virtual(&self, fd: RawFd) -> bool {
        fd & VIRTUAL_BIT != 0
    }

    /// Map a virtual flow id to the one real descriptor backing it; real
    /// descriptors map to themselves.
    pub fn translate_socket(&self, virtual_fd: RawFd) -> RawFd {
        if self.is_virtual(virtual_fd) {
            self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(virtual_fd)
        } else {
            virtual_fd
        }
    }

    /// Derive a stable virtual id for a `(src, dst, sport, dport)` tuple
    /// without waiting for a datagram to arrive, e.g. when pre-seeding a
    /// flow from CMSG-derived original-destination data.
    pub fn flow_id_for(&self, src: SocketAddr, dst: SocketAddr) -> RawFd {
        let key = session_key(src, dst);
        (key as i32) | VIRTUAL_BIT
    }

    /// Register a flow under a pre-computed virtual id before its first
    /// datagram arrives, so a transparent-redirect rewrite of the original
    /// destination can be applied up front rather than racing the first
    /// `accept()`.
    pub fn seed_flow(&self, vfd: RawFd, peer: SocketAddr) {
        self.flows.lock().entry(vfd).or_insert_with(|| Flow { peer, inbox: Default::default() });
    }

    /// Like [`UdpCom::seed_flow`], but also deposits an already-read
    /// datagram payload into the flow's inbox. Used by the threaded receiver
    /// when it has consumed the first datagram itself (via a raw `recvmsg`
    /// to recover CMSG original-destination data) and must hand that payload
    /// off rather than let the normal `accept()` path read it again.
    pub fn seed_flow_with_data(&self, vfd: RawFd, peer: SocketAddr, data: &[u8]) {
        let mut flows = self.flows.lock();
        let flow = flows.entry(vfd).or_insert_with(|| Flow { peer, inbox: Default::default() });
        flow.inbox.push_back(data.to_vec());
    }

    /// The peer address this flow (virtual or real-connected) talks to, if
    /// known. Used to surface `host`/`port` on the CX built over this com.
    pub fn flow_peer(&self, fd: RawFd) -> Option<SocketAddr> {
        if self.is_virtual(fd) {
            self.flows.lock().get(&fd).map(|f| f.peer)
        } else {
            self.connected_peer
        }
    }

    pub fn l3_proto(&self) -> L3Proto {
        L3Proto::Ip4
    }

    pub fn l4_proto(&self) -> L4Proto {
        L4Proto::Udp
    }

    pub fn shortname(&self) -> &'static str {
        "udp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_bit_marks_synthesized_ids() {
        let c = UdpCom::new();
        assert!(c.is_virtual(VIRTUAL_BIT | 5));
        assert!(!c.is_virtual(5));
    }

    #[test]
    fn translate_socket_is_identity_for_real_fd() {
        let c = UdpCom::new();
        assert_eq!(c.translate_socket(42), 42);
    }

    #[test]
    fn flow_id_for_is_stable_across_calls() {
        let c = UdpCom::new();
        let src: SocketAddr = "10.0.0.1:1111".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:2222".parse().unwrap();
        let a = c.flow_id_for(src, dst);
        let b = c.flow_id_for(src, dst);
        assert_eq!(a, b);
        assert!(c.is_virtual(a));
    }
}
