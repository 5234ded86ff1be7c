//! Pooled HTTP client provider.
//!
//! [`ClientProvider`] owns two lazily built, shared `reqwest` clients (TLS
//! verified and unverified, no explicit proxy) and builds a private client for
//! every request that names a proxy. Callers receive a [`ClientLease`] which
//! says whether the client must be closed after use; dropping the lease closes
//! an owned client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{Client, ClientBuilder, Proxy, redirect};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use super::constants::{MAX_IDLE_CONNECTIONS_PER_HOST, MAX_REDIRECTS, POOL_IDLE_TIMEOUT};
use super::error::DownloadError;
use crate::user_agent;

/// Selects which client instance a request borrows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Proxy URL; when set the request gets its own non-pooled client.
    pub proxy_url: Option<String>,
    /// Whether server TLS certificates are verified.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            verify_tls: true,
        }
    }
}

impl ClientConfig {
    /// Config for a direct connection with the given trust setting.
    #[must_use]
    pub fn direct(verify_tls: bool) -> Self {
        Self {
            proxy_url: None,
            verify_tls,
        }
    }

    /// Config routed through `proxy_url`.
    #[must_use]
    pub fn proxied(proxy_url: impl Into<String>, verify_tls: bool) -> Self {
        Self {
            proxy_url: Some(proxy_url.into()),
            verify_tls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseScope {
    Shared,
    Owned,
}

/// A client borrowed from a [`ClientProvider`].
///
/// Owned (proxy-scoped) clients are closed when the lease is released or
/// dropped, so every exit path of the borrower closes them.
#[derive(Debug)]
pub struct ClientLease {
    client: Arc<Client>,
    scope: LeaseScope,
}

impl ClientLease {
    /// The underlying reqwest client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether the borrower is responsible for closing this client.
    #[must_use]
    pub fn must_close(&self) -> bool {
        self.scope == LeaseScope::Owned
    }

    /// Returns true when both leases point at the same client instance.
    #[must_use]
    pub fn shares_client_with(&self, other: &ClientLease) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }

    /// Releases the lease, closing the client if it is owned.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if self.scope == LeaseScope::Owned {
            debug!("closing proxy-scoped HTTP client");
        }
    }
}

/// Provider of pooled HTTP clients.
///
/// Create one per process (or per test), wrap it in an `Arc` and hand it to
/// the [`BatchDownloader`](super::BatchDownloader). The shared clients are
/// built on first use, exactly once each, even under concurrent first use.
///
/// # Example
///
/// ```no_run
/// use fetchbatch_core::download::{ClientConfig, ClientProvider};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = ClientProvider::new();
/// let lease = provider.acquire(&ClientConfig::default()).await?;
/// assert!(!lease.must_close());
/// let response = lease.client().get("https://example.com").send().await?;
/// println!("status: {}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClientProvider {
    verified: OnceCell<Arc<Client>>,
    unverified: OnceCell<Arc<Client>>,
    shut_down: AtomicBool,
}

impl ClientProvider {
    /// Creates a provider; no client is built until the first acquisition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lends a client for `config`.
    ///
    /// - proxy set: a new client for that proxy, `must_close() == true`
    /// - no proxy, `verify_tls == false`: the shared unverified client
    /// - otherwise: the shared verified client
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ProviderShutDown`] after [`shutdown`](Self::shutdown),
    /// or [`DownloadError::ClientBuild`] if the client cannot be built.
    #[instrument(level = "debug", skip(self), fields(proxied = config.proxy_url.is_some(), verify_tls = config.verify_tls))]
    pub async fn acquire(&self, config: &ClientConfig) -> Result<ClientLease, DownloadError> {
        if self.is_shut_down() {
            return Err(DownloadError::ProviderShutDown);
        }

        if let Some(proxy_url) = config.proxy_url.as_deref() {
            let client = build_client(config.verify_tls, Some(proxy_url))?;
            debug!("built proxy-scoped HTTP client");
            return Ok(ClientLease {
                client: Arc::new(client),
                scope: LeaseScope::Owned,
            });
        }

        let cell = if config.verify_tls {
            &self.verified
        } else {
            &self.unverified
        };
        let client = cell
            .get_or_try_init(|| async {
                debug!(verify_tls = config.verify_tls, "building shared HTTP client");
                build_client(config.verify_tls, None).map(Arc::new)
            })
            .await?;

        Ok(ClientLease {
            client: Arc::clone(client),
            scope: LeaseScope::Shared,
        })
    }

    /// Stops lending clients.
    ///
    /// Requests already holding a lease run to completion; the shared pools
    /// drain once the provider and the last lease are dropped.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!("HTTP client provider shut down");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

fn base_client_builder(verify_tls: bool) -> ClientBuilder {
    Client::builder()
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .danger_accept_invalid_certs(!verify_tls)
        .gzip(true)
        .deflate(true)
        .brotli(true)
        .zstd(true)
        .user_agent(user_agent::default_download_user_agent())
}

fn build_client(verify_tls: bool, proxy_url: Option<&str>) -> Result<Client, DownloadError> {
    let mut builder = base_client_builder(verify_tls);
    if let Some(proxy_url) = proxy_url {
        let proxy = Proxy::all(proxy_url).map_err(DownloadError::client_build)?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(DownloadError::client_build)
}
