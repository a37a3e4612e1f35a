//! Threaded receiver: a dedicated accept/datagram thread that owns the
//! listening descriptor, recovers transparent-redirect original-destination
//! metadata from ancillary control data, and fans connections/flows out to
//! a fixed pool of worker threads chosen by a stable hash of the session
//! key.
//!
//! TCP: each accepted connection becomes one [`WorkItem`] carrying a fresh
//! [`Com::Tcp`] built over the accepted fd.
//!
//! UDP: the receiver owns the one real listening socket; each first
//! datagram of a new flow is demultiplexed into a virtual flow id (shared
//! with the workers via the same `Arc`-backed flow table [`UdpCom`]
//! already uses) and enqueued once, while later datagrams of the same flow
//! are simply appended to that flow's inbox for the worker already
//! servicing it to read on its own schedule.

use std::collections::HashMap;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use slog::{debug, o, warn, Logger};

use crate::com::{Com, UdpCom};
use crate::config::ProxyConfig;
use crate::error::ComError;
use crate::sockflow::{session_key, worker_index};

/// Port -> redirect target mapping consulted before a freshly accepted
/// connection or flow is enqueued, letting an embedder rewrite the
/// transparently-intercepted original destination (e.g. a 443-by-SNI
/// redirect table) ahead of the worker ever seeing it.
pub struct RedirectMap {
    targets: Mutex<HashMap<u16, (String, u16)>>,
}

impl RedirectMap {
    fn new() -> Self {
        Self { targets: Mutex::new(HashMap::new()) }
    }

    pub fn instance() -> &'static RedirectMap {
        static MAP: OnceLock<RedirectMap> = OnceLock::new();
        MAP.get_or_init(RedirectMap::new)
    }

    pub fn add(&self, port: u16, target: (String, u16)) {
        self.targets.lock().insert(port, target);
    }

    pub fn clear(&self) {
        self.targets.lock().clear();
    }

    pub fn redirect_for(&self, original_port: u16) -> Option<(String, u16)> {
        self.targets.lock().get(&original_port).cloned()
    }
}

/// One unit of work handed from the receiver thread to a worker: a
/// communicator ready to be registered with the worker's own proxy, plus
/// the session/original-destination metadata the worker needs to decide
/// where to connect the other side.
pub struct WorkItem {
    pub com: Com,
    pub session_key: u32,
    pub peer: Option<SocketAddr>,
    pub original_dst: Option<SocketAddr>,
}

/// Dedicated accept/datagram thread plus the per-worker channels it fans
/// `WorkItem`s out to. Dropping this stops the receiver thread by closing
/// the listening descriptor's last reference; callers that need a clean
/// shutdown should arrange for `accept`/`recv` to observe an error (e.g. by
/// closing the fd from another thread) since this is a blocking accept
/// loop, matching the original design's dedicated-thread-per-listener
/// shape.
pub struct ThreadedReceiver {
    log: Logger,
    worker_txs: Vec<Sender<WorkItem>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedReceiver {
    /// Spawn a TCP receiver bound to `listen_addr`. `transparent` enables
    /// `IP_TRANSPARENT` on the listening socket and `SO_ORIGINAL_DST`
    /// recovery on each accepted connection, for proxying connections that
    /// were transparently redirected at the network layer.
    pub fn spawn_tcp(
        log: Logger,
        listen_addr: &str,
        config: &ProxyConfig,
        transparent: bool,
    ) -> Result<(Self, Vec<Receiver<WorkItem>>), ComError> {
        let mut listen_com = if transparent { crate::com::TcpCom::new_transparent() } else { crate::com::TcpCom::new() };
        let listen_fd = listen_com.bind(listen_addr)?;
        let _ = listen_fd;

        let (txs, rxs): (Vec<_>, Vec<_>) = (0..config.worker_count.max(1)).map(|_| mpsc::channel()).unzip();
        let worker_count = txs.len();
        let thread_log = log.new(o!("component" => "tcp-receiver"));
        let txs_for_thread = txs.clone();

        let handle = thread::spawn(move || {
            loop {
                match listen_com.accept(listen_fd) {
                    Ok((fd, addr_str)) => {
                        let com = unsafe { Com::Tcp(crate::com::TcpCom::from_accepted(fd)) };
                        let peer: Option<SocketAddr> = addr_str.as_deref().and_then(|s| s.parse().ok());
                        let original_dst = if transparent { original_dst_tcp(fd) } else { None };
                        let key = match (peer, original_dst) {
                            (Some(p), Some(d)) => session_key(p, d),
                            (Some(p), None) => session_key(p, p),
                            _ => 0,
                        };
                        let idx = worker_index(key, worker_count);
                        let item = WorkItem { com, session_key: key, peer, original_dst };
                        if txs_for_thread[idx].send(item).is_err() {
                            warn!(thread_log, "worker channel closed, dropping accepted connection"; "worker" => idx);
                        }
                    }
                    Err(ComError::WouldBlock) => {
                        thread::yield_now();
                    }
                    Err(e) => {
                        debug!(thread_log, "tcp receiver accept loop exiting"; "error" => %e);
                        break;
                    }
                }
            }
        });

        Ok((Self { log, worker_txs: txs, handle: Some(handle) }, rxs))
    }

    /// Spawn a UDP receiver bound to `listen_addr`. The listening com is
    /// transparent-bound and CMSG-enabled so the receiver thread can
    /// recover each datagram's original destination; virtual flow ids are
    /// minted from the session key exactly as [`UdpCom::accept`] would, so
    /// workers can keep treating a flow as a single CX regardless of
    /// whether it was demultiplexed here or by a worker's own `accept()`.
    pub fn spawn_udp(
        log: Logger,
        listen_addr: &str,
        config: &ProxyConfig,
        transparent: bool,
    ) -> Result<(Self, Vec<Receiver<WorkItem>>), ComError> {
        let mut listen_com = if transparent { UdpCom::new_transparent() } else { UdpCom::new() };
        let listen_fd = listen_com.bind(listen_addr)?;
        let shared = Arc::new(listen_com);

        let (txs, rxs): (Vec<_>, Vec<_>) = (0..config.worker_count.max(1)).map(|_| mpsc::channel()).unzip();
        let worker_count = txs.len();
        let thread_log = log.new(o!("component" => "udp-receiver"));
        let txs_for_thread = txs.clone();
        let known_flows: Mutex<std::collections::HashSet<RawFd>> = Mutex::new(std::collections::HashSet::new());

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 65536];
            loop {
                let ipv6 = listen_addr.parse::<SocketAddr>().map(|a| a.is_ipv6()).unwrap_or(false);
                match recv_with_original_dst(listen_fd, &mut buf, ipv6) {
                    Ok((n, peer, original_dst)) => {
                        let dst = original_dst.unwrap_or(peer);
                        let key = session_key(peer, dst);
                        let vfd = shared.flow_id_for(peer, dst);

                        let is_new = known_flows.lock().insert(vfd);
                        shared.seed_flow_with_data(vfd, peer, &buf[..n]);

                        if is_new {
                            let idx = worker_index(key, worker_count);
                            let com = Com::Udp(shared.bind_to_flow(vfd));
                            let item = WorkItem { com, session_key: key, peer: Some(peer), original_dst };
                            if txs_for_thread[idx].send(item).is_err() {
                                warn!(thread_log, "worker channel closed, dropping udp flow"; "worker" => idx);
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::yield_now();
                    }
                    Err(e) => {
                        debug!(thread_log, "udp receiver recv loop exiting"; "error" => %e);
                        break;
                    }
                }
            }
        });

        Ok((Self { log, worker_txs: txs, handle: Some(handle) }, rxs))
    }

    pub fn worker_count(&self) -> usize {
        self.worker_txs.len()
    }

    pub fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ThreadedReceiver {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(self.log, "threaded receiver dropped with its accept thread still running");
        }
    }
}

/// Recover the pre-NAT original destination of an already-accepted TCP
/// connection via `getsockopt(SO_ORIGINAL_DST)`, the standard mechanism for
/// connections redirected by an iptables `REDIRECT`/`TPROXY` rule.
fn original_dst_tcp(fd: RawFd) -> Option<SocketAddr> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if rc != 0 {
            return None;
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}

/// Receive one datagram on `fd` via a raw `recvmsg`, recovering both the
/// sender address and (when present) the `IP_ORIGDSTADDR`/
/// `IPV6_ORIGDSTADDR` ancillary control message carrying the original
/// destination a transparent-proxy rule intercepted this datagram from.
fn recv_with_original_dst(fd: RawFd, buf: &mut [u8], ipv6: bool) -> std::io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut ctrl = [0u8; 256];
    let mut peer_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut peer_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ctrl.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let peer = sockaddr_storage_to_std(&peer_storage).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "recvmsg returned no peer address")
    })?;

    let mut original_dst = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let is_origdst = if ipv6 {
                hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_ORIGDSTADDR
            } else {
                hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_ORIGDSTADDR
            };
            if is_origdst {
                let data = libc::CMSG_DATA(cmsg);
                if ipv6 {
                    let mut a: libc::sockaddr_in6 = mem::zeroed();
                    std::ptr::copy_nonoverlapping(data, &mut a as *mut _ as *mut u8, mem::size_of::<libc::sockaddr_in6>());
                    let ip = Ipv6Addr::from(a.sin6_addr.s6_addr);
                    original_dst = Some(SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(a.sin6_port), 0, 0)));
                } else {
                    let mut a: libc::sockaddr_in = mem::zeroed();
                    std::ptr::copy_nonoverlapping(data, &mut a as *mut _ as *mut u8, mem::size_of::<libc::sockaddr_in>());
                    let ip = Ipv4Addr::from(u32::from_be(a.sin_addr.s_addr));
                    original_dst = Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(a.sin_port))));
                }
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, peer, original_dst))
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => unsafe {
            let a = *(storage as *const _ as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(a.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(a.sin_port))))
        },
        libc::AF_INET6 => unsafe {
            let a = *(storage as *const _ as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(a.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(a.sin6_port), 0, 0)))
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_map_add_then_lookup() {
        let map = RedirectMap::new();
        map.add(8443, ("10.0.0.5".to_string(), 443));
        assert_eq!(map.redirect_for(8443), Some(("10.0.0.5".to_string(), 443)));
        assert_eq!(map.redirect_for(9999), None);
        map.clear();
        assert_eq!(map.redirect_for(8443), None);
    }

    #[test]
    fn redirect_map_singleton_is_shared() {
        RedirectMap::instance().add(1234, ("example".into(), 80));
        assert_eq!(RedirectMap::instance().redirect_for(1234), Some(("example".to_string(), 80)));
        RedirectMap::instance().clear();
    }
}
