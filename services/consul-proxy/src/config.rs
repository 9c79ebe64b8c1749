//! Proxy configuration.
//!
//! The JSON file format:
//!
//! ```json
//! {
//!   "ConsulServer": { "Address": "consul:8500", "DnsName": "consul.service.", "DnsServer": "10.0.0.2", "DnsPort": "53" },
//!   "Proxies": [ { "ServiceName": "web", "Datacenter": "dc1", "LocalIP": "0.0.0.0", "LocalPort": 9090 } ],
//!   "PollIntervalSecs": 30
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// DNS server used for SRV lookups when none is configured.
pub const DEFAULT_DNS_SERVER: &str = "localhost";

/// DNS port used for SRV lookups when none is configured.
pub const DEFAULT_DNS_PORT: &str = "53";

/// Directory refresh interval when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How the discovery backend (the Consul HTTP API) is located.
///
/// A non-empty `address` always wins; otherwise `dns_name` is resolved with
/// an SRV query against `dns_server:dns_port`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryBackendConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub dns_server: Option<String>,
    #[serde(default)]
    pub dns_port: Option<String>,
}

impl DiscoveryBackendConfig {
    /// Static override address, if set and non-empty.
    pub fn override_address(&self) -> Option<&str> {
        non_empty(&self.address)
    }

    /// SRV name of the discovery backend, if set and non-empty.
    pub fn dns_name(&self) -> Option<&str> {
        non_empty(&self.dns_name)
    }

    pub fn dns_server(&self) -> &str {
        non_empty(&self.dns_server).unwrap_or(DEFAULT_DNS_SERVER)
    }

    pub fn dns_port(&self) -> &str {
        non_empty(&self.dns_port).unwrap_or(DEFAULT_DNS_PORT)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn default_bind_host() -> String {
    "localhost".to_string()
}

/// One proxied service: a local listener forwarding to a discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedServiceSpec {
    #[serde(rename = "ServiceName")]
    pub service_name: String,

    /// Consul datacenter to scope the query to.
    #[serde(rename = "Datacenter", default)]
    pub partition: Option<String>,

    #[serde(rename = "LocalIP", default = "default_bind_host")]
    pub local_bind_host: String,

    #[serde(rename = "LocalPort")]
    pub local_port: u16,
}

impl ProxiedServiceSpec {
    pub fn new(
        service_name: impl Into<String>,
        local_bind_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            partition: None,
            local_bind_host: local_bind_host.into(),
            local_port,
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Partition, if set and non-empty.
    pub fn partition(&self) -> Option<&str> {
        non_empty(&self.partition)
    }
}

impl fmt::Display for ProxiedServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> Consul({})",
            self.local_bind_host, self.local_port, self.service_name
        )?;
        if let Some(dc) = self.partition() {
            write!(f, "@{dc}")?;
        }
        Ok(())
    }
}

/// Fully resolved configuration for one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "ConsulServer", default)]
    pub discovery: DiscoveryBackendConfig,

    #[serde(rename = "Proxies", default)]
    pub proxies: Vec<ProxiedServiceSpec>,

    #[serde(rename = "PollIntervalSecs", default)]
    pub poll_interval_secs: Option<u64>,
}

impl ProxyConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Invalid proxy configuration JSON")
    }

    /// Read and parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Interval between directory refreshes (at least one second).
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_secs
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// Check that the configuration can start at least one proxy.
    pub fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            bail!("No proxied services specified. Please either specify --service or --config-file");
        }

        if self.discovery.override_address().is_none() && self.discovery.dns_name().is_none() {
            bail!("Unable to find the consul server. Please either specify --consul-server-override or --consul-dns-name");
        }

        for proxy in &self.proxies {
            if proxy.service_name.trim().is_empty() {
                bail!("Proxy on port {} has an empty service name", proxy.local_port);
            }
        }

        Ok(())
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proxies: Vec<String> = self.proxies.iter().map(ToString::to_string).collect();
        write!(
            f,
            "DnsServer: {}, Consul Server: {}, Proxies: [{}]",
            self.discovery.dns_server(),
            self.discovery
                .override_address()
                .or(self.discovery.dns_name())
                .unwrap_or("<unset>"),
            proxies.join(", ")
        )
    }
}
