//! Parameters governing the proxy core and the TLS interception layer.
//!
//! Loading these from a file (or CLI flags) is the embedder's job; this
//! module only defines the shape and sane defaults, the way the teacher's
//! `endpoint::Config` groups its constants and derives them in `Default`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::vars::{
    BOTTLENECK_THRESHOLD, CLIENTHELLO_PEEK_SIZE, DEFAULT_IDLE_DELAY_SECS,
    DEFAULT_RECONNECT_DELAY_SECS, DEFAULT_RESCAN_GRANULARITY_SECS, READBUF_INIT_SIZE,
    READBUF_MAX_SIZE,
};

/// Parameters governing the readiness loop and the per-CX buffering/backpressure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Initial size of a CX's read buffer.
    pub readbuf_init_size: usize,
    /// Maximum size a CX's read buffer may grow to.
    pub readbuf_max_size: usize,
    /// Peer write-buffer occupancy above which a side stops being read.
    pub bottleneck_threshold: usize,
    /// Seconds a non-blocking connect/handshake may remain `opening` before timing out.
    pub reconnect_delay_secs: u64,
    /// Seconds of complete inactivity before a CX (and its proxy) is considered dead.
    pub idle_delay_secs: u64,
    /// Seconds between the poller's deferred-rescan timer firing.
    pub rescan_granularity_secs: u64,
    /// Number of worker proxies a [`crate::receiver::ThreadedReceiver`] fans out to.
    pub worker_count: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            readbuf_init_size: READBUF_INIT_SIZE,
            readbuf_max_size: READBUF_MAX_SIZE,
            bottleneck_threshold: BOTTLENECK_THRESHOLD,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            idle_delay_secs: DEFAULT_IDLE_DELAY_SECS,
            rescan_granularity_secs: DEFAULT_RESCAN_GRANULARITY_SECS,
            worker_count: 4,
        }
    }
}

/// Parameters governing the certificate factory and the TLS communicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding `ca-cert.pem`/`ca-key.pem`, `cl-cert.pem`/`cl-key.pem`,
    /// `sr-cert.pem`/`sr-key.pem`, loaded at factory init.
    pub certs_path: PathBuf,
    /// Directory of additional trusted root CAs (PEM), used to build the
    /// client-side trust store when verifying the real server's certificate.
    pub trust_store_path: Option<PathBuf>,
    /// Capacity shared by the mint, OCSP, CRL and session caches.
    pub cache_capacity: usize,
    /// OCSP response TTL, seconds.
    pub ocsp_ttl_secs: u64,
    /// CRL TTL, seconds.
    pub crl_ttl_secs: u64,
    /// Bytes pre-peeked from the client socket while looking for a ClientHello.
    pub clienthello_peek_size: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certs_path: PathBuf::from("./certs/"),
            trust_store_path: None,
            cache_capacity: 500,
            ocsp_ttl_secs: 1800,
            crl_ttl_secs: 86400,
            clienthello_peek_size: CLIENTHELLO_PEEK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_config_default_matches_spec_constants() {
        let c = ProxyConfig::default();
        assert_eq!(c.bottleneck_threshold, 200_000);
        assert_eq!(c.readbuf_max_size, 1024 * 1024);
        assert_eq!(c.reconnect_delay_secs, 7);
        assert_eq!(c.idle_delay_secs, 3600);
    }

    #[test]
    fn tls_config_round_trips_through_toml() {
        let c = TlsConfig::default();
        let text = toml::to_string(&c).expect("serialize");
        let back: TlsConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(back.cache_capacity, c.cache_capacity);
        assert_eq!(back.ocsp_ttl_secs, c.ocsp_ttl_secs);
    }
}
