//! Dynamic TCP proxy for services registered in Consul.
//!
//! Each configured service gets a local listener. Connections are forwarded
//! to the first healthy instance from an [`EndpointDirectory`], which keeps a
//! periodically refreshed snapshot of the service's passing instances.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
mod net;
pub mod proxy;

pub use config::{DiscoveryBackendConfig, ProxiedServiceSpec, ProxyConfig};
pub use discovery::{
    BackendResolver, ConsulHealthQuerier, DiscoveryBackendResolver, Endpoint, EndpointDirectory,
    EndpointSnapshot, ServiceQuerier, SrvLookup, StaticResolver, UdpSrvLookup,
};
pub use error::{DiscoveryError, DnsError, ProxyError};
pub use proxy::{ProxyEngine, ProxyStats};

/// Build identifier baked in at compile time.
pub const BUILD: &str = match option_env!("CONSUL_PROXY_BUILD") {
    Some(build) => build,
    None => "dev",
};
