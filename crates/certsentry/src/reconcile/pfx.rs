//! PKCS12 (PFX) encoding.
//!
//! The reconciliation engine treats PKCS12 encoding as an opaque capability:
//! PEM in, DER-encoded PKCS12 out. The legacy variant uses the old
//! SHA1/3DES/RC2 algorithms and exists only for applications that cannot
//! read modern containers.

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;
use thiserror::Error;

/// Which PKCS12 algorithm family to encode with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfxVariant {
    /// Current algorithms (AES, SHA-2)
    Modern,
    /// SHA1/3DES/RC2, for applications that require it
    Legacy,
}

/// PKCS12 encoding errors
#[derive(Debug, Error)]
pub enum PfxError {
    #[error("openssl error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),

    #[error("certificate pem contained no certificates")]
    EmptyChain,
}

/// Opaque PKCS12 encoder capability
pub trait PfxEncoder: Send + Sync {
    /// Encode the key, leaf certificate, and remaining chain into a
    /// password-protected PKCS12 container.
    fn encode(
        &self,
        variant: PfxVariant,
        key_pem: &[u8],
        cert_pem: &[u8],
        password: &str,
    ) -> Result<Vec<u8>, PfxError>;
}

/// [`PfxEncoder`] backed by OpenSSL's PKCS12 builder
#[derive(Debug, Default)]
pub struct OpensslPfxEncoder;

impl PfxEncoder for OpensslPfxEncoder {
    fn encode(
        &self,
        variant: PfxVariant,
        key_pem: &[u8],
        cert_pem: &[u8],
        password: &str,
    ) -> Result<Vec<u8>, PfxError> {
        let key = PKey::private_key_from_pem(key_pem)?;

        // first block is the leaf, the rest is the chain
        let mut certs = X509::stack_from_pem(cert_pem)?;
        if certs.is_empty() {
            return Err(PfxError::EmptyChain);
        }
        let leaf = certs.remove(0);

        let mut chain = Stack::new()?;
        for cert in certs {
            chain.push(cert)?;
        }

        let mut builder = Pkcs12::builder();
        builder.pkey(&key).cert(&leaf).ca(chain);

        if variant == PfxVariant::Legacy {
            builder
                .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
                .cert_algorithm(Nid::PBE_WITHSHA1AND40BITRC2_CBC)
                .mac_md(MessageDigest::sha1());
        }

        let pfx = builder.build2(password)?;
        Ok(pfx.to_der()?)
    }
}
