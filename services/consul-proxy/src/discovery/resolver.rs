//! Discovery backend address resolution.
//!
//! The Consul HTTP API is either reached at a statically configured
//! address, or located through a DNS SRV query. When several SRV answers
//! are returned the first one (in answer order) is used.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::dns::{self, DEFAULT_DNS_TIMEOUT};
use crate::config::DiscoveryBackendConfig;
use crate::error::{DiscoveryError, DnsError};

/// Resolves the address of the discovery backend for one refresh.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn resolve(&self) -> Result<String, DiscoveryError>;
}

/// DNS SRV transport seam.
#[async_trait]
pub trait SrvLookup: Send + Sync {
    /// Return every SRV answer for `name` as `host:port`, in answer order.
    async fn lookup_srv(&self, server: &str, port: &str, name: &str)
        -> Result<Vec<String>, DnsError>;
}

/// SRV lookups over UDP.
#[derive(Debug, Clone)]
pub struct UdpSrvLookup {
    timeout: Duration,
}

impl UdpSrvLookup {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_DNS_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for UdpSrvLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SrvLookup for UdpSrvLookup {
    async fn lookup_srv(
        &self,
        server: &str,
        port: &str,
        name: &str,
    ) -> Result<Vec<String>, DnsError> {
        dns::lookup_srv(server, port, name, self.timeout).await
    }
}

/// Resolve the discovery backend address described by `config`.
///
/// A non-empty override address is returned without any network call.
pub async fn resolve_backend_address(
    config: &DiscoveryBackendConfig,
    srv: &dyn SrvLookup,
) -> Result<String, DiscoveryError> {
    if let Some(address) = config.override_address() {
        return Ok(address.to_string());
    }

    let name = config.dns_name().ok_or(DiscoveryError::NotConfigured)?;
    let server = config.dns_server();
    let port = config.dns_port();

    debug!(dns_name = %name, dns_server = %server, dns_port = %port, "Looking up SRV record");

    let answers = srv.lookup_srv(server, port, name).await.map_err(|e| {
        warn!(dns_name = %name, error = %e, "Failed to execute DNS SRV lookup");
        e
    })?;

    let address = answers
        .into_iter()
        .next()
        .ok_or_else(|| DiscoveryError::NoSrvRecords(name.to_string()))?;

    info!(address = %address, "Found consul server");
    Ok(address)
}

/// [`BackendResolver`] backed by a shared [`DiscoveryBackendConfig`].
pub struct DiscoveryBackendResolver {
    config: Arc<DiscoveryBackendConfig>,
    srv: Arc<dyn SrvLookup>,
}

impl DiscoveryBackendResolver {
    /// Create a resolver that performs SRV lookups over UDP.
    pub fn new(config: Arc<DiscoveryBackendConfig>) -> Self {
        Self::with_lookup(config, Arc::new(UdpSrvLookup::new()))
    }

    /// Create a resolver with a custom SRV transport.
    pub fn with_lookup(config: Arc<DiscoveryBackendConfig>, srv: Arc<dyn SrvLookup>) -> Self {
        Self { config, srv }
    }
}

#[async_trait]
impl BackendResolver for DiscoveryBackendResolver {
    async fn resolve(&self) -> Result<String, DiscoveryError> {
        resolve_backend_address(&self.config, self.srv.as_ref()).await
    }
}

/// Resolver that always returns the same address.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    address: String,
}

impl StaticResolver {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl BackendResolver for StaticResolver {
    async fn resolve(&self) -> Result<String, DiscoveryError> {
        Ok(self.address.clone())
    }
}
