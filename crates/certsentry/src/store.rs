//! Thread-safe live certificate store.
//!
//! Holds the current key/cert PEM pair and its parsed rustls
//! [`CertifiedKey`], and is the single source of truth for what certificate
//! the HTTPS listener serves. Updates are linearized by an exclusive lock;
//! the handshake path reads an atomic pointer and never reparses.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::crypto::aws_lc_rs;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::trace;

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key and certificate do not parse as a matching pair
    #[error("key/cert pair is invalid or mismatched: {0}")]
    InvalidKeyPair(String),

    /// The certificate PEM could not be parsed
    #[error("certificate pem did not parse: {0}")]
    BadCertificate(String),

    /// The private key PEM could not be parsed
    #[error("private key pem did not parse: {0}")]
    BadKey(String),
}

/// The stored material behind the lock
struct Material {
    key_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    not_after: DateTime<Utc>,
}

/// Thread-safe holder of the live key/cert pair
///
/// # Thread Safety
///
/// PEM material and metadata are guarded by a read/write lock. The parsed
/// [`CertifiedKey`] used on the handshake path is published through an
/// atomic pointer swap so `resolve` never contends with an in-flight update
/// beyond the pointer load.
pub struct CertificateStore {
    inner: RwLock<Option<Material>>,
    live: ArcSwapOption<CertifiedKey>,
}

impl CertificateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
            live: ArcSwapOption::const_empty(),
        }
    }

    /// Install a new key/cert PEM pair.
    ///
    /// Returns `Ok(false)` without reparsing when both blobs are
    /// byte-identical to what is already stored. Otherwise the pair is
    /// validated (the key must correspond to the leaf certificate) and both
    /// the PEM and the parsed certificate are replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKeyPair`] when the pair does not parse
    /// or does not match; the previously stored material is left untouched.
    pub fn update(&self, key_pem: &[u8], cert_pem: &[u8]) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();

        if let Some(current) = inner.as_ref() {
            if current.key_pem == key_pem && current.cert_pem == cert_pem {
                trace!("key/cert pair unchanged, skipping update");
                return Ok(false);
            }
        }

        let certified = build_certified_key(key_pem, cert_pem)?;
        let not_after = leaf_not_after(cert_pem)?;

        *inner = Some(Material {
            key_pem: key_pem.to_vec(),
            cert_pem: cert_pem.to_vec(),
            not_after,
        });
        self.live.store(Some(Arc::new(certified)));

        Ok(true)
    }

    /// Snapshot of the stored key and cert PEM, if any
    pub fn read(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.inner
            .read()
            .as_ref()
            .map(|m| (m.key_pem.clone(), m.cert_pem.clone()))
    }

    /// Expiry of the stored leaf certificate, if any
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.inner.read().as_ref().map(|m| m.not_after)
    }

    /// True when a certificate is stored and its leaf has not expired
    pub fn has_valid_certificate(&self) -> bool {
        self.inner
            .read()
            .as_ref()
            .map(|m| m.not_after > Utc::now())
            .unwrap_or(false)
    }

    /// The parsed certificate served on handshakes (pointer load, no locks)
    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.live.load_full()
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("has_material", &self.inner.read().is_some())
            .finish()
    }
}

/// rustls certificate resolver backed by a [`CertificateStore`]
///
/// Handed to the TLS listener so every handshake serves whatever pair is
/// currently installed, without restarting the listener.
#[derive(Clone)]
pub struct LiveCertResolver {
    store: Arc<CertificateStore>,
}

impl LiveCertResolver {
    /// Create a resolver over the given store
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for LiveCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.store.certified_key()
    }
}

impl std::fmt::Debug for LiveCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCertResolver").finish()
    }
}

/// Parse and consistency-check a PEM pair into a [`CertifiedKey`]
fn build_certified_key(key_pem: &[u8], cert_pem: &[u8]) -> Result<CertifiedKey, StoreError> {
    let chain = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::BadCertificate(e.to_string()))?;
    if chain.is_empty() {
        return Err(StoreError::BadCertificate(
            "no certificates in pem".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| StoreError::BadKey(e.to_string()))?
        .ok_or_else(|| StoreError::BadKey("no private key in pem".to_string()))?;

    // from_der verifies the key against the end-entity certificate
    CertifiedKey::from_der(chain, key, &aws_lc_rs::default_provider())
        .map_err(|e| StoreError::InvalidKeyPair(e.to_string()))
}

/// Extract the `notAfter` instant of the first certificate in the PEM
pub(crate) fn leaf_not_after(cert_pem: &[u8]) -> Result<DateTime<Utc>, StoreError> {
    let block = pem::parse(cert_pem).map_err(|e| StoreError::BadCertificate(e.to_string()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(block.contents())
        .map_err(|e| StoreError::BadCertificate(e.to_string()))?;

    let ts = cert.validity().not_after.to_datetime().unix_timestamp();
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| StoreError::BadCertificate("notAfter out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_pair(name: &str) -> (Vec<u8>, Vec<u8>) {
        let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (key.serialize_pem().into_bytes(), cert.pem().into_bytes())
    }

    #[test]
    fn test_update_installs_material() {
        let store = CertificateStore::new();
        assert!(store.read().is_none());
        assert!(store.certified_key().is_none());

        let (key, cert) = generate_pair("localhost");
        assert!(store.update(&key, &cert).unwrap());

        let (stored_key, stored_cert) = store.read().unwrap();
        assert_eq!(stored_key, key);
        assert_eq!(stored_cert, cert);
        assert!(store.certified_key().is_some());
    }

    #[test]
    fn test_repeated_update_reports_unchanged() {
        let store = CertificateStore::new();
        let (key, cert) = generate_pair("localhost");

        assert!(store.update(&key, &cert).unwrap());
        assert!(!store.update(&key, &cert).unwrap());
        assert!(!store.update(&key, &cert).unwrap());
    }

    #[test]
    fn test_mismatched_pair_rejected_and_store_untouched() {
        let store = CertificateStore::new();
        let (key_a, cert_a) = generate_pair("a.example.com");
        let (_, cert_b) = generate_pair("b.example.com");

        store.update(&key_a, &cert_a).unwrap();
        let before = store.certified_key().unwrap();

        let err = store.update(&key_a, &cert_b).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKeyPair(_)));

        // old material still live
        let (stored_key, stored_cert) = store.read().unwrap();
        assert_eq!(stored_key, key_a);
        assert_eq!(stored_cert, cert_a);
        assert!(Arc::ptr_eq(&before, &store.certified_key().unwrap()));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        let store = CertificateStore::new();
        assert!(store.update(b"not a key", b"not a cert").is_err());
        assert!(!store.has_valid_certificate());
    }

    #[test]
    fn test_has_valid_certificate() {
        let store = CertificateStore::new();
        assert!(!store.has_valid_certificate());

        let (key, cert) = generate_pair("localhost");
        store.update(&key, &cert).unwrap();
        assert!(store.has_valid_certificate());
    }

    #[test]
    fn test_expired_certificate_is_invalid() {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let store = CertificateStore::new();
        store
            .update(key.serialize_pem().as_bytes(), cert.pem().as_bytes())
            .unwrap();
        assert!(!store.has_valid_certificate());
    }

    #[test]
    fn test_resolver_tracks_updates() {
        let store = Arc::new(CertificateStore::new());
        let resolver = LiveCertResolver::new(Arc::clone(&store));

        let (key_a, cert_a) = generate_pair("a.example.com");
        store.update(&key_a, &cert_a).unwrap();
        let first = store.certified_key().unwrap();

        let (key_b, cert_b) = generate_pair("b.example.com");
        store.update(&key_b, &cert_b).unwrap();
        let second = store.certified_key().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        // resolver serves the latest pointer
        assert!(Arc::ptr_eq(&second, &resolver.store.certified_key().unwrap()));
    }

    #[test]
    fn test_leaf_not_after_matches_cert() {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_after = rcgen::date_time_ymd(2031, 6, 15);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let not_after = leaf_not_after(cert.pem().as_bytes()).unwrap();
        assert_eq!(not_after.format("%Y-%m-%d").to_string(), "2031-06-15");
    }
}
