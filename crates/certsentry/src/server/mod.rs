//! HTTPS listener for the push endpoint
//!
//! Serves the live certificate from the [`CertificateStore`] on every
//! handshake and routes requests to the [`PushReceiver`]. Shutdown stops
//! the accept loop and drains in-flight connections up to a bounded grace
//! period.

mod drain;
mod push;

pub use drain::ConnectionDrain;
pub use push::{PushReceiver, INSTALL_ROUTE};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{CertificateStore, LiveCertResolver};

/// Time allowed for a client to send its request head
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for in-flight connections to finish during shutdown
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// HTTPS server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("https server cannot bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("tls configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// TLS listener serving the push endpoint with the store's live certificate
pub struct HttpsServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    receiver: Arc<PushReceiver>,
    drain: ConnectionDrain,
}

impl HttpsServer {
    /// Bind the listener and build the TLS acceptor around the store's
    /// certificate resolver.
    pub async fn bind(
        address: &str,
        port: u16,
        store: Arc<CertificateStore>,
        receiver: Arc<PushReceiver>,
    ) -> Result<Self, ServerError> {
        let addr = format!("{address}:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            ServerError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;

        // provider is explicit so another rustls backend in the dependency
        // graph cannot change which one serves handshakes
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(LiveCertResolver::new(store)));
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!(addr = %addr, "https server bound");

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            receiver,
            drain: ConnectionDrain::new(DRAIN_GRACE),
        })
    }

    /// The bound socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until `shutdown` fires, then drain.
    pub async fn serve(self, shutdown: CancellationToken) {
        info!("https server accepting connections");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let acceptor = self.acceptor.clone();
                    let receiver = Arc::clone(&self.receiver);
                    let active = self.drain.track();

                    tokio::spawn(async move {
                        let _active = active;

                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "tls handshake failed");
                                return;
                            }
                        };

                        let service = service_fn(move |req| {
                            let receiver = Arc::clone(&receiver);
                            async move {
                                Ok::<_, Infallible>(receiver.handle(peer, req).await)
                            }
                        });

                        let result = http1::Builder::new()
                            .timer(TokioTimer::new())
                            .header_read_timeout(HEADER_READ_TIMEOUT)
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await;
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        // stop accepting, let in-flight requests finish
        drop(self.listener);
        info!("https server draining connections");
        if !self.drain.wait_for_drain().await {
            warn!("connection drain timed out, forcing shutdown");
        }
        info!("https server shutdown complete");
    }
}
