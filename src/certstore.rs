//! Certificate factory: mints spoofed leaf certificates signed by a local
//! CA (or self-signed), keyed by a canonical store key so the same
//! original certificate always maps back to the same spoofed one.
//!
//! Mint results plus the OCSP/CRL/session artifacts a TLS handshake
//! produces are cached with bounded LRUs; everything lives behind one
//! reentrant lock since minting can recursively look up an already-cached
//! entry while still holding it (the original factory uses a recursive
//! mutex for the same reason).

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::ReentrantMutex;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, SanType, SerialNumber};
use slog::{debug, o, Logger};
use std::cell::RefCell;
use time::{Duration as TimeDuration, OffsetDateTime};
use x509_parser::prelude::*;

use crate::error::CertStoreError;

/// Options controlling how a replacement leaf certificate is built.
#[derive(Debug, Clone, Default)]
pub struct SpoofOptions {
    /// Sign the forged leaf with itself instead of the loaded CA.
    pub self_signed: bool,
    /// Extra SANs to merge in on top of whatever the original certificate carried.
    pub additional_sans: Vec<String>,
}

/// A minted certificate/key pair, PEM-encoded the way `rustls` consumes them.
#[derive(Debug, Clone)]
pub struct SpoofedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

struct CachedOcsp {
    response: Vec<u8>,
    fetched_at: Instant,
}

struct CachedCrl {
    data: Vec<u8>,
    fetched_at: Instant,
}

struct Inner {
    ca_cert_pem: Option<String>,
    ca_key_pem: Option<String>,
    mint_cache: LruCache<String, SpoofedCert>,
    ocsp_cache: LruCache<String, CachedOcsp>,
    crl_cache: LruCache<String, CachedCrl>,
    session_cache: LruCache<String, Vec<u8>>,
    ocsp_ttl: Duration,
    crl_ttl: Duration,
}

/// The certificate factory. Cheap to clone-by-reference (wrap in an `Arc`
/// at the embedding site); internally single-instance per proxy core.
pub struct CertFactory {
    log: Logger,
    lock: ReentrantMutex<RefCell<Inner>>,
    next_serial: AtomicU64,
}

impl CertFactory {
    pub fn new(log: Logger, cache_capacity: usize, ocsp_ttl: Duration, crl_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        Self {
            log,
            lock: ReentrantMutex::new(RefCell::new(Inner {
                ca_cert_pem: None,
                ca_key_pem: None,
                mint_cache: LruCache::new(cap),
                ocsp_cache: LruCache::new(cap),
                crl_cache: LruCache::new(cap),
                session_cache: LruCache::new(cap),
                ocsp_ttl,
                crl_ttl,
            })),
            next_serial: AtomicU64::new(seed.max(1)),
        }
    }

    /// The next serial number in the factory's monotonically increasing,
    /// wall-clock-seeded sequence.
    fn next_serial_number(&self) -> SerialNumber {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        SerialNumber::from(serial.to_be_bytes().to_vec())
    }

    /// Load `ca-cert.pem`/`ca-key.pem` from `certs_path`. Without a loaded
    /// CA, [`Self::spoof`] can still produce self-signed certificates but
    /// fails for CA-signed requests.
    pub fn load_ca(&self, certs_path: &Path) -> Result<(), CertStoreError> {
        let cert_path = certs_path.join("ca-cert.pem");
        let key_path = certs_path.join("ca-key.pem");
        let cert_pem = std::fs::read_to_string(&cert_path)
            .map_err(|e| CertStoreError::LoadCa(cert_path.display().to_string(), e.to_string()))?;
        let key_pem = std::fs::read_to_string(&key_path)
            .map_err(|e| CertStoreError::LoadCa(key_path.display().to_string(), e.to_string()))?;

        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.ca_cert_pem = Some(cert_pem);
        inner.ca_key_pem = Some(key_pem);
        debug!(self.log, "loaded CA certificate and key"; "path" => %certs_path.display());
        Ok(())
    }

    /// Extract the list of DNS SAN entries from a DER-encoded original
    /// certificate.
    pub fn get_sans(original_der: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok((_, cert)) = X509Certificate::from_der(original_der) {
            for ext in cert.extensions() {
                if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                    for name in &san.general_names {
                        if let GeneralName::DNSName(dns) = name {
                            out.push((*dns).to_string());
                        }
                    }
                }
            }
        }
        out
    }

    /// The canonical cache key for a spoofed certificate: the original's
    /// subject line, with `+self_signed` and any number of `+san:<name>`
    /// suffixes appended. Two requests with identical subject, sign mode and
    /// SAN set always land on the same cached mint -- intentionally, this
    /// does not fold the original certificate's signature into the key, so
    /// re-spoofing after a CA rotation still reuses the prior leaf.
    pub fn make_store_key(subject: &str, original_der: &[u8], opts: &SpoofOptions) -> String {
        let mut key = subject.to_string();
        if opts.self_signed {
            key.push_str("+self_signed");
        }
        let mut sans = Self::get_sans(original_der);
        for extra in &opts.additional_sans {
            if !sans.contains(extra) {
                sans.push(extra.clone());
            }
        }
        for san in sans {
            key.push_str("+san:");
            key.push_str(&san);
        }
        key
    }

    /// Look up a cached store key by the fqdn a client asked for, falling
    /// back to the wildcard form (`foo.example.com` -> `*.example.com`) if
    /// the exact name was never minted.
    pub fn find_subject_by_fqdn(&self, fqdn: &str) -> Option<String> {
        let guard = self.lock.lock();
        let inner = guard.borrow();
        if inner.mint_cache.contains(fqdn) {
            return Some(fqdn.to_string());
        }
        drop(inner);

        let wildcard = wildcard_form(fqdn);
        let guard = self.lock.lock();
        let inner = guard.borrow();
        if inner.mint_cache.contains(&wildcard) {
            return Some(wildcard);
        }
        None
    }

    /// Produce (minting and caching, or returning the cached) a leaf
    /// certificate for `subject`/`original_der`, signed by the loaded CA
    /// unless `opts.self_signed`.
    pub fn spoof(&self, subject: &str, original_der: &[u8], opts: &SpoofOptions) -> Result<SpoofedCert, CertStoreError> {
        let store_key = Self::make_store_key(subject, original_der, opts);

        {
            let guard = self.lock.lock();
            let mut inner = guard.borrow_mut();
            if let Some(cached) = inner.mint_cache.get(&store_key) {
                return Ok(cached.clone());
            }
        }

        let mut params = CertificateParams::new(Self::get_sans(original_der));
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name_of(subject));
        params.distinguished_name = dn;
        for extra in &opts.additional_sans {
            params.subject_alt_names.push(SanType::DnsName(extra.clone()));
        }
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(1);
        params.not_after = now + TimeDuration::days(364);
        params.serial_number = Some(self.next_serial_number());

        let cert = Certificate::from_params(params)
            .map_err(|e| CertStoreError::Sign(e.to_string()))?;

        let (cert_pem, key_pem) = if opts.self_signed {
            (
                cert.serialize_pem().map_err(|e| CertStoreError::Sign(e.to_string()))?,
                cert.serialize_private_key_pem(),
            )
        } else {
            let guard = self.lock.lock();
            let inner = guard.borrow();
            let ca_cert_pem = inner.ca_cert_pem.clone();
            let ca_key_pem = inner.ca_key_pem.clone();
            drop(inner);

            let (ca_cert_pem, ca_key_pem) = match (ca_cert_pem, ca_key_pem) {
                (Some(c), Some(k)) => (c, k),
                _ => return Err(CertStoreError::LoadCa("ca".into(), "CA not loaded".into())),
            };

            let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem, rcgen::KeyPair::from_pem(&ca_key_pem).map_err(|e| CertStoreError::Sign(e.to_string()))?)
                .map_err(|e| CertStoreError::Sign(e.to_string()))?;
            let ca = Certificate::from_params(ca_params).map_err(|e| CertStoreError::Sign(e.to_string()))?;

            let signed_pem = cert
                .serialize_pem_with_signer(&ca)
                .map_err(|e| CertStoreError::Sign(e.to_string()))?;
            (signed_pem, cert.serialize_private_key_pem())
        };

        let spoofed = SpoofedCert { cert_pem, key_pem };

        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.mint_cache.put(store_key.clone(), spoofed.clone());
        debug!(self.log, "minted spoofed certificate"; "store_key" => %store_key);
        Ok(spoofed)
    }

    pub fn cache_ocsp(&self, key: &str, response: Vec<u8>) {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.ocsp_cache.put(key.to_string(), CachedOcsp { response, fetched_at: Instant::now() });
    }

    pub fn get_ocsp(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        let ttl = inner.ocsp_ttl;
        match inner.ocsp_cache.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < ttl => Some(entry.response.clone()),
            _ => None,
        }
    }

    pub fn cache_crl(&self, key: &str, data: Vec<u8>) {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.crl_cache.put(key.to_string(), CachedCrl { data, fetched_at: Instant::now() });
    }

    pub fn get_crl(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        let ttl = inner.crl_ttl;
        match inner.crl_cache.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < ttl => Some(entry.data.clone()),
            _ => None,
        }
    }

    pub fn cache_session(&self, key: &str, ticket: Vec<u8>) {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.session_cache.put(key.to_string(), ticket);
    }

    pub fn get_session(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.session_cache.get(key).cloned()
    }
}

fn wildcard_form(fqdn: &str) -> String {
    match fqdn.split_once('.') {
        Some((_, rest)) if rest.contains('.') => format!("*.{}", rest),
        _ => fqdn.to_string(),
    }
}

fn common_name_of(subject: &str) -> String {
    subject
        .split(',')
        .find_map(|part| part.trim().strip_prefix("CN=").map(|s| s.to_string()))
        .unwrap_or_else(|| subject.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn wildcard_form_replaces_leftmost_label() {
        assert_eq!(wildcard_form("foo.example.com"), "*.example.com");
        assert_eq!(wildcard_form("example.com"), "example.com");
    }

    #[test]
    fn common_name_extracts_cn_field() {
        assert_eq!(common_name_of("CN=example.com,O=Example"), "example.com");
        assert_eq!(common_name_of("no-cn-here"), "no-cn-here");
    }

    #[test]
    fn store_key_is_stable_for_identical_inputs() {
        let opts = SpoofOptions::default();
        let k1 = CertFactory::make_store_key("CN=example.com", &[], &opts);
        let k2 = CertFactory::make_store_key("CN=example.com", &[], &opts);
        assert_eq!(k1, k2);
    }

    #[test]
    fn store_key_marks_self_signed() {
        let opts = SpoofOptions { self_signed: true, additional_sans: vec![] };
        let key = CertFactory::make_store_key("CN=example.com", &[], &opts);
        assert!(key.ends_with("+self_signed"));
    }

    #[test]
    fn spoof_without_loaded_ca_errors_unless_self_signed() {
        let factory = CertFactory::new(test_logger(), 16, Duration::from_secs(1), Duration::from_secs(1));
        let err = factory.spoof("CN=example.com", &[], &SpoofOptions::default()).unwrap_err();
        assert_matches::assert_matches!(err, CertStoreError::LoadCa(_, _));
    }

    #[test]
    fn self_signed_spoof_is_cached_on_second_call() {
        let factory = CertFactory::new(test_logger(), 16, Duration::from_secs(1), Duration::from_secs(1));
        let opts = SpoofOptions { self_signed: true, additional_sans: vec![] };
        let first = factory.spoof("CN=example.com", &[], &opts).expect("mint");
        let second = factory.spoof("CN=example.com", &[], &opts).expect("cached");
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn spoofed_cert_has_a_positive_serial_and_a_364_day_validity_window() {
        let factory = CertFactory::new(test_logger(), 16, Duration::from_secs(1), Duration::from_secs(1));
        let opts = SpoofOptions { self_signed: true, additional_sans: vec![] };
        let spoofed = factory.spoof("CN=example.com", &[], &opts).expect("mint");

        let (_, pem) = x509_parser::pem::parse_x509_pem(spoofed.cert_pem.as_bytes()).expect("pem");
        let (_, cert) = pem.parse_x509().expect("der");

        let serial = cert.tbs_certificate.raw_serial();
        assert!(serial.iter().any(|b| *b != 0), "serial must be nonzero");

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        assert!(not_before <= now);
        assert!(not_after - now > 363 * 86_400 && not_after - now <= 365 * 86_400);
    }

    #[test]
    fn successive_mints_use_increasing_serial_numbers() {
        let factory = CertFactory::new(test_logger(), 16, Duration::from_secs(1), Duration::from_secs(1));
        let first = factory.next_serial_number();
        let second = factory.next_serial_number();
        assert_ne!(first, second);
    }
}
