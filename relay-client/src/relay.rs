//! Multi-host relay client.
//!
//! Maps host URLs to lazily created [`PairingCoordinator`]s. Two spellings of
//! the same origin share one coordinator.

use std::sync::Arc;

use dashmap::DashMap;
use mte_relay_types::HostIdentity;
use tokio::io::AsyncWrite;

use crate::codec::{RelayRequest, RelayResponse};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::host::{DownloadResponse, PairingCoordinator, RelayBackends};
use crate::stream::UploadSource;

/// Entry point for applications.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use mte_relay_client::{HttpTransport, RelayBackends, RelayClient, RelayConfig, RelayRequest};
///
/// let backends = RelayBackends::new(Arc::new(HttpTransport::new()));
/// let client = RelayClient::new(RelayConfig::default(), backends)?;
///
/// let response = client
///     .send("https://api.example.com", RelayRequest::get("api/profile"))
///     .await?;
/// ```
pub struct RelayClient {
    config: Arc<RelayConfig>,
    overrides: DashMap<HostIdentity, Arc<RelayConfig>>,
    backends: RelayBackends,
    hosts: DashMap<HostIdentity, Arc<PairingCoordinator>>,
}

impl RelayClient {
    /// Create a client. Nothing is contacted until the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(config: RelayConfig, backends: RelayBackends) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            overrides: DashMap::new(),
            backends,
            hosts: DashMap::new(),
        })
    }

    /// Use `config` for `host` instead of the default.
    ///
    /// Takes effect when the host's coordinator is created, so set it
    /// before the first request or call [`forget`](Self::forget) first.
    pub fn with_host_config(&self, host: &str, config: RelayConfig) -> Result<(), RelayError> {
        config.validate()?;
        let host = HostIdentity::parse(host)?;
        self.overrides.insert(host, Arc::new(config));
        Ok(())
    }

    /// Coordinator for `host`, created on first use.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn coordinator(&self, host: &str) -> Result<Arc<PairingCoordinator>, RelayError> {
        let host = HostIdentity::parse(host)?;
        let entry = self.hosts.entry(host.clone()).or_insert_with(|| {
            let config = self
                .overrides
                .get(&host)
                .map(|c| Arc::clone(c.value()))
                .unwrap_or_else(|| Arc::clone(&self.config));
            tracing::debug!("Creating coordinator for {}", host);
            PairingCoordinator::spawn(host, config, self.backends.clone())
        });
        Ok(Arc::clone(entry.value()))
    }

    /// Hosts with a live coordinator.
    pub fn hosts(&self) -> Vec<HostIdentity> {
        let mut hosts: Vec<HostIdentity> = self.hosts.iter().map(|e| e.key().clone()).collect();
        hosts.sort();
        hosts
    }

    /// Relay `request` to `host`.
    pub async fn send(&self, host: &str, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        self.coordinator(host)?.send(request).await
    }

    /// Relay `request` to `host` with `source` streamed as the body.
    pub async fn upload(
        &self,
        host: &str,
        request: RelayRequest,
        source: &dyn UploadSource,
    ) -> Result<RelayResponse, RelayError> {
        self.coordinator(host)?.upload(request, source).await
    }

    /// Relay `request` to `host` and stream the response body into `sink`.
    ///
    /// On `Err` the sink may already hold plaintext that was never
    /// authenticated; discard it.
    pub async fn download<W>(
        &self,
        host: &str,
        request: RelayRequest,
        sink: &mut W,
    ) -> Result<DownloadResponse, RelayError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.coordinator(host)?.download(request, sink).await
    }

    /// Discard the pairing with `host` and pair again.
    pub async fn repair(&self, host: &str) -> Result<(), RelayError> {
        self.coordinator(host)?.repair().await
    }

    /// Drop the coordinator for `host` and its persisted state.
    pub async fn forget(&self, host: &str) -> Result<(), RelayError> {
        let host = HostIdentity::parse(host)?;
        self.hosts.remove(&host);
        self.backends.store.clear(&host).await?;
        tracing::info!("Forgot pairing with {}", host);
        Ok(())
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("hosts", &self.hosts())
            .finish_non_exhaustive()
    }
}
