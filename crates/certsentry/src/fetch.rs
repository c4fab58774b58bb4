//! Authenticated PEM download from the remote issuing service.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Remote service endpoints
const ENDPOINT_DOWNLOAD_KEYS: &str = "/api/v1/download/privatekeys";
const ENDPOINT_DOWNLOAD_CERTS: &str = "/api/v1/download/certificates";

/// Outbound request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote fetch errors; non-fatal, they drive fetch-retry scheduling
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0} fetching pem")]
    Status(u16),

    #[error("response body was not valid pem")]
    NotPem,
}

/// Downloads key and certificate PEM with per-resource API keys
pub struct RemoteFetcher {
    client: reqwest::Client,
    server_address: String,
    key_name: String,
    key_api_key: String,
    cert_name: String,
    cert_api_key: String,
}

impl RemoteFetcher {
    /// Build a fetcher for the given remote service and resource names
    pub fn new(
        server_address: String,
        key_name: String,
        key_api_key: String,
        cert_name: String,
        cert_api_key: String,
    ) -> Result<Self, FetchError> {
        let user_agent = format!(
            "certsentry/{} ({}; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(FETCH_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            server_address,
            key_name,
            key_api_key,
            cert_name,
            cert_api_key,
        })
    }

    /// Build a fetcher from the agent configuration
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Self::new(
            config.server_address.clone(),
            config.key_name.clone(),
            config.key_api_key.clone(),
            config.cert_name.clone(),
            config.cert_api_key.clone(),
        )
    }

    /// Download the private key PEM
    pub async fn fetch_key(&self) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}{}/{}",
            self.server_address, ENDPOINT_DOWNLOAD_KEYS, self.key_name
        );
        self.fetch_pem(url, &self.key_api_key).await
    }

    /// Download the certificate chain PEM
    pub async fn fetch_certchain(&self) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}{}/{}",
            self.server_address, ENDPOINT_DOWNLOAD_CERTS, self.cert_name
        );
        self.fetch_pem(url, &self.cert_api_key).await
    }

    /// Download both halves of the pair
    pub async fn fetch_pair(&self) -> Result<(Vec<u8>, Vec<u8>), FetchError> {
        let key_pem = self.fetch_key().await?;
        let cert_pem = self.fetch_certchain().await?;
        Ok((key_pem, cert_pem))
    }

    /// GET a PEM body with the resource API key in the `apiKey` header.
    ///
    /// # Errors
    ///
    /// Any non-200 status or a body that does not contain at least one
    /// well-formed PEM block is an error.
    async fn fetch_pem(&self, url: String, api_key: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url = %url, "fetching pem from remote");

        let response = self
            .client
            .get(&url)
            .header("apiKey", api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let blocks = pem::parse_many(&body).map_err(|_| FetchError::NotPem)?;
        if blocks.is_empty() {
            return Err(FetchError::NotPem);
        }

        Ok(body.to_vec())
    }
}

impl std::fmt::Debug for RemoteFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFetcher")
            .field("server_address", &self.server_address)
            .field("key_name", &self.key_name)
            .field("cert_name", &self.cert_name)
            .finish()
    }
}
