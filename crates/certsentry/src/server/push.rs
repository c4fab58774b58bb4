//! Encrypted certificate push handling.
//!
//! The remote service pushes new material as an AES-256-GCM envelope:
//! the POST body is JSON `{"payload": "<base64url-no-pad>"}` where the
//! decoded bytes are `nonce ‖ ciphertext` and the decrypted plaintext is
//! JSON `{"key_pem": "...", "cert_pem": "..."}`.
//!
//! Every failure up to and including decryption is answered with a bare
//! 401, without revealing which stage failed.

use std::net::SocketAddr;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::schedule::{JobKind, Scheduler};
use crate::reconcile::ReconciliationEngine;
use crate::store::CertificateStore;

/// Path the remote service pushes new material to
pub const INSTALL_ROUTE: &str = "/api/v1/install";

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Outer request body
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    /// base64url (no padding) of `nonce ‖ ciphertext`
    payload: String,
}

/// Decrypted payload
#[derive(Debug, Deserialize)]
struct InnerPayload {
    key_pem: String,
    cert_pem: String,
}

/// Why a push was rejected; maps onto the response status
enum PushRejection {
    /// Undifferentiated auth/decode/decrypt failure (401)
    Unauthorized,
    /// Authenticated but the decrypted payload is malformed (400)
    Malformed,
}

/// Decrypts and installs pushed certificate material
pub struct PushReceiver {
    cipher: Aes256Gcm,
    store: Arc<CertificateStore>,
    engine: Arc<ReconciliationEngine>,
    scheduler: Arc<Scheduler>,
}

impl PushReceiver {
    /// Create a receiver sharing the given AES-256 key with the remote service
    pub fn new(
        aes_key: &[u8; 32],
        store: Arc<CertificateStore>,
        engine: Arc<ReconciliationEngine>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(aes_key)),
            store,
            engine,
            scheduler,
        }
    }

    /// Handle one HTTP request.
    ///
    /// Anything other than a POST to the install route is a 404. A valid
    /// push updates the store, reconciles missing files immediately, and
    /// schedules a deferred write job only when the disk is still stale.
    pub async fn handle<B>(&self, peer: SocketAddr, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path();
        let route_matches = path == INSTALL_ROUTE || path.strip_suffix('/') == Some(INSTALL_ROUTE);
        if !route_matches || req.method() != Method::POST {
            return empty_response(StatusCode::NOT_FOUND);
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(peer = %peer, error = %e, "failed to read push body");
                return empty_response(StatusCode::UNAUTHORIZED);
            }
        };

        let inner = match self.open_envelope(peer, &body) {
            Ok(inner) => inner,
            Err(PushRejection::Unauthorized) => return empty_response(StatusCode::UNAUTHORIZED),
            Err(PushRejection::Malformed) => return empty_response(StatusCode::BAD_REQUEST),
        };

        match self
            .store
            .update(inner.key_pem.as_bytes(), inner.cert_pem.as_bytes())
        {
            Ok(true) => info!("new tls key/cert pair installed from push"),
            Ok(false) => info!("pushed key/cert pair identical to current, no update performed"),
            Err(e) => {
                error!(error = %e, "pushed key/cert pair rejected");
                return empty_response(StatusCode::BAD_REQUEST);
            }
        }

        // write any missing files now; stale-but-present files wait for the
        // maintenance window via a deferred job
        let engine = Arc::clone(&self.engine);
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            let disk_still_stale = engine.reconcile(true).await;
            if disk_still_stale {
                scheduler.schedule(JobKind::WriteToDisk);
            } else {
                scheduler.cancel_pending();
            }
        });

        empty_response(StatusCode::OK)
    }

    /// Decode and decrypt the push body into its inner payload.
    fn open_envelope(&self, peer: SocketAddr, body: &[u8]) -> Result<InnerPayload, PushRejection> {
        let envelope: PushEnvelope = serde_json::from_slice(body).map_err(|e| {
            debug!(peer = %peer, error = %e, "push body did not decode");
            PushRejection::Unauthorized
        })?;

        let raw = URL_SAFE_NO_PAD
            .decode(envelope.payload.as_bytes())
            .map_err(|e| {
                debug!(peer = %peer, error = %e, "push payload was not valid base64");
                PushRejection::Unauthorized
            })?;

        if raw.len() < NONCE_LEN {
            debug!(peer = %peer, "push payload shorter than nonce");
            return Err(PushRejection::Unauthorized);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                debug!(peer = %peer, "push payload failed to decrypt");
                PushRejection::Unauthorized
            })?;

        info!(peer = %peer, "authenticated payload received");

        serde_json::from_slice(&plaintext).map_err(|e| {
            error!(peer = %peer, error = %e, "decrypted push payload did not decode");
            PushRejection::Malformed
        })
    }
}

impl std::fmt::Debug for PushReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushReceiver").finish()
    }
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PfxFileConfig;
    use crate::fetch::RemoteFetcher;
    use crate::reconcile::{OpensslPfxEncoder, StorageLayout};
    use crate::schedule::MaintenanceWindow;
    use chrono::NaiveTime;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const TEST_KEY: [u8; 32] = [7u8; 32];

    fn generate_pair() -> (String, String) {
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (key.serialize_pem(), cert.pem())
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<CertificateStore>,
        receiver: PushReceiver,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CertificateStore::new());
        let layout = StorageLayout {
            dir: dir.path().to_path_buf(),
            key_mode: 0o600,
            cert_mode: 0o644,
            pfx: None::<PfxFileConfig>,
            legacy_pfx: None,
        };
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&store),
            layout,
            Box::new(OpensslPfxEncoder),
            None,
        ));
        let window = MaintenanceWindow::new(
            NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
            MaintenanceWindow::all_days(),
        );
        let fetcher = Arc::new(
            RemoteFetcher::new(
                "https://127.0.0.1:1".to_string(),
                "key".to_string(),
                "key-api".to_string(),
                "cert".to_string(),
                "cert-api".to_string(),
            )
            .unwrap(),
        );
        let scheduler = Scheduler::new(
            window,
            Arc::clone(&store),
            Arc::clone(&engine),
            fetcher,
            CancellationToken::new(),
        );

        let receiver = PushReceiver::new(&TEST_KEY, Arc::clone(&store), engine, scheduler);

        Fixture {
            _dir: dir,
            store,
            receiver,
        }
    }

    fn encrypt_payload(plaintext: &[u8]) -> String {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&TEST_KEY));
        let nonce = [9u8; NONCE_LEN];
        let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), plaintext).unwrap();

        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(raw)
    }

    fn install_request(body: String) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(INSTALL_ROUTE)
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_push_installs_material() {
        let f = fixture();
        let (key_pem, cert_pem) = generate_pair();

        let inner = json!({"key_pem": key_pem, "cert_pem": cert_pem}).to_string();
        let body = json!({"payload": encrypt_payload(inner.as_bytes())}).to_string();

        let response = f.receiver.handle(peer(), install_request(body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let (stored_key, stored_cert) = f.store.read().unwrap();
        assert_eq!(stored_key, key_pem.into_bytes());
        assert_eq!(stored_cert, cert_pem.into_bytes());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_rejected_and_store_untouched() {
        let f = fixture();
        let (key_pem, cert_pem) = generate_pair();

        let inner = json!({"key_pem": key_pem, "cert_pem": cert_pem}).to_string();
        let payload = encrypt_payload(inner.as_bytes());

        // flip one bit inside the ciphertext
        let mut raw = URL_SAFE_NO_PAD.decode(payload.as_bytes()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);

        let body = json!({"payload": tampered}).to_string();
        let response = f.receiver.handle(peer(), install_request(body)).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(f.store.read().is_none());
    }

    #[tokio::test]
    async fn test_wrong_path_and_method_are_not_found() {
        let f = fixture();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/v2/install")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(
            f.receiver.handle(peer(), req).await.status(),
            StatusCode::NOT_FOUND
        );

        let req = Request::builder()
            .method(Method::GET)
            .uri(INSTALL_ROUTE)
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(
            f.receiver.handle(peer(), req).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_trailing_slash_accepted() {
        let f = fixture();
        let (key_pem, cert_pem) = generate_pair();

        let inner = json!({"key_pem": key_pem, "cert_pem": cert_pem}).to_string();
        let body = json!({"payload": encrypt_payload(inner.as_bytes())}).to_string();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/install/")
            .body(Full::new(Bytes::from(body)))
            .unwrap();

        assert_eq!(f.receiver.handle(peer(), req).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_json_body_unauthorized() {
        let f = fixture();
        let response = f
            .receiver
            .handle(peer(), install_request("not json at all".to_string()))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_base64_unauthorized() {
        let f = fixture();
        let body = json!({"payload": "!!!not-base64!!!"}).to_string();
        let response = f.receiver.handle(peer(), install_request(body)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_short_payload_unauthorized() {
        let f = fixture();
        let body = json!({"payload": URL_SAFE_NO_PAD.encode([1u8, 2, 3])}).to_string();
        let response = f.receiver.handle(peer(), install_request(body)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_authenticated_garbage_is_bad_request() {
        let f = fixture();

        // encrypts fine, but the plaintext is not the expected json
        let body = json!({"payload": encrypt_payload(b"hello there")}).to_string();
        let response = f.receiver.handle(peer(), install_request(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mismatched_pair_is_bad_request() {
        let f = fixture();
        let (key_pem, _) = generate_pair();
        let (_, other_cert) = generate_pair();

        let inner = json!({"key_pem": key_pem, "cert_pem": other_cert}).to_string();
        let body = json!({"payload": encrypt_payload(inner.as_bytes())}).to_string();

        let response = f.receiver.handle(peer(), install_request(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(f.store.read().is_none());
    }
}
