//! Session-key derivation and original-destination address pairing.
//!
//! The original implementation seeded a `std::mt19937` from a
//! `std::seed_seq` built over the four address/port fields and used the
//! generator's first output as the key. Rust's standard dependency stack
//! has no equivalent seedable-from-bytes PRNG suitable for this, so this
//! keys on FNV hashing of the same tuple instead: deterministic, already a
//! crate dependency, and — like the original — not meant to be
//! cryptographically strong, only to spread session ids evenly across a
//! hash map.

use std::hash::Hasher;
use std::net::SocketAddr;

use fnv::FnvHasher;

/// A stable key for the 4-tuple identifying a flow, used to route incoming
/// datagrams/connections to the same worker and to demultiplex UDP virtual
/// flows. Not a security-sensitive value; collisions are handled by normal
/// hash-map probing at the call site, not relied upon to be unique.
pub fn session_key(src: SocketAddr, dst: SocketAddr) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(&addr_bytes(src));
    hasher.write_u16(src.port());
    hasher.write(&addr_bytes(dst));
    hasher.write_u16(dst.port());
    let full = hasher.finish();
    (full as u32) ^ ((full >> 32) as u32)
}

fn addr_bytes(addr: SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(a) => a.ip().octets().to_vec(),
        SocketAddr::V6(a) => a.ip().octets().to_vec(),
    }
}

/// Pick which of `N` workers a flow's traffic should land on, given its
/// session key. Stable for the lifetime of the flow: every packet of the
/// same 4-tuple hashes to the same worker.
pub fn worker_index(key: u32, worker_count: usize) -> usize {
    if worker_count == 0 {
        0
    } else {
        (key as usize) % worker_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_deterministic() {
        let src: SocketAddr = "192.168.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert_eq!(session_key(src, dst), session_key(src, dst));
    }

    #[test]
    fn session_key_distinguishes_swapped_endpoints() {
        let a: SocketAddr = "192.168.0.1:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert_ne!(session_key(a, b), session_key(b, a));
    }

    #[test]
    fn worker_index_is_stable_and_in_range() {
        let src: SocketAddr = "192.168.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let key = session_key(src, dst);
        let idx = worker_index(key, 4);
        assert!(idx < 4);
        assert_eq!(idx, worker_index(key, 4));
    }

    #[test]
    fn worker_index_handles_zero_workers() {
        assert_eq!(worker_index(123, 0), 0);
    }
}
