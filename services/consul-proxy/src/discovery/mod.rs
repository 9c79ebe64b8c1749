//! Service discovery through Consul.
//!
//! ## Architecture
//!
//! ```text
//! DiscoveryBackendConfig -> BackendResolver (override | DNS SRV)
//!                                  |
//!                           consul address
//!                                  |
//!                           ServiceQuerier (health API, passing only)
//!                                  |
//!                           EndpointDirectory (ArcSwap snapshot)
//! ```

pub mod consul;
pub mod directory;
pub mod dns;
pub mod endpoint;
pub mod resolver;

pub use consul::{ConsulHealthQuerier, ServiceQuerier};
pub use directory::EndpointDirectory;
pub use endpoint::{Endpoint, EndpointSnapshot};
pub use resolver::{
    resolve_backend_address, BackendResolver, DiscoveryBackendResolver, SrvLookup,
    StaticResolver, UdpSrvLookup,
};
