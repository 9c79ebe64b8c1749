//! Consul health API client.
//!
//! Queries `GET /v1/health/service/{service}?passing=true[&dc={datacenter}]`
//! and maps each entry to the address and port the service instance was
//! registered with.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use super::endpoint::Endpoint;
use crate::error::DiscoveryError;

/// Request timeout for one health query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Looks up the healthy instances of a service.
#[async_trait]
pub trait ServiceQuerier: Send + Sync {
    async fn healthy_instances(
        &self,
        backend_address: &str,
        service_name: &str,
        partition: Option<&str>,
    ) -> Result<Vec<Endpoint>, DiscoveryError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    node: Option<NodeInfo>,
    service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(default)]
    address: String,
    port: u16,
}

impl ServiceEntry {
    /// Service address, falling back to the node address when the service
    /// was registered without one.
    fn into_endpoint(self) -> Endpoint {
        let host = if self.service.address.is_empty() {
            self.node.map(|n| n.address).unwrap_or_default()
        } else {
            self.service.address
        };
        Endpoint::new(host, self.service.port)
    }
}

/// Build the health endpoint URL for a service.
fn health_url(
    backend_address: &str,
    service_name: &str,
    partition: Option<&str>,
) -> Result<Url, DiscoveryError> {
    let invalid = |detail: String| DiscoveryError::InvalidAddress {
        address: backend_address.to_string(),
        detail,
    };

    let base = if backend_address.starts_with("http://") || backend_address.starts_with("https://")
    {
        backend_address.to_string()
    } else {
        format!("http://{backend_address}")
    };

    let mut url = Url::parse(&base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("address cannot be a base URL".to_string()))?
        .pop_if_empty()
        .extend(["v1", "health", "service", service_name]);

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("passing", "true");
        if let Some(dc) = partition {
            query.append_pair("dc", dc);
        }
    }

    Ok(url)
}

/// [`ServiceQuerier`] over the Consul HTTP API.
pub struct ConsulHealthQuerier {
    client: reqwest::Client,
}

impl ConsulHealthQuerier {
    /// Create a new querier.
    pub fn new() -> Result<Self, DiscoveryError> {
        Self::with_timeout(DEFAULT_QUERY_TIMEOUT)
    }

    /// Create a new querier with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("consul-proxy/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ServiceQuerier for ConsulHealthQuerier {
    async fn healthy_instances(
        &self,
        backend_address: &str,
        service_name: &str,
        partition: Option<&str>,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        let url = health_url(backend_address, service_name, partition)?;
        debug!(
            url = %url,
            service = %service_name,
            datacenter = partition.unwrap_or(""),
            "Querying consul for healthy instances"
        );

        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::Status { status, body });
        }

        let entries: Vec<ServiceEntry> = resp.json().await?;
        Ok(entries.into_iter().map(ServiceEntry::into_endpoint).collect())
    }
}
