//! Error types for discovery and proxying.

use std::io;

use thiserror::Error;

/// Errors from the DNS SRV exchange.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The DNS server address could not be resolved.
    #[error("dns server {server} could not be resolved: {detail}")]
    ServerUnresolvable { server: String, detail: String },

    /// UDP send/receive failed.
    #[error("dns transport error: {0}")]
    Io(#[from] io::Error),

    /// No response within the exchange timeout.
    #[error("dns query to {server} timed out")]
    Timeout { server: String },

    /// The queried name is not encodable (empty label, label over 63 bytes).
    #[error("invalid dns name: {0}")]
    InvalidName(String),

    /// The message could not be encoded or decoded.
    #[error("dns message error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// The packet decoded but is not a response.
    #[error("malformed dns response: {0}")]
    Malformed(&'static str),

    /// The response id did not match the query id.
    #[error("dns response id mismatch (sent {sent}, got {received})")]
    IdMismatch { sent: u16, received: u16 },

    /// The server answered with a non-zero RCODE.
    #[error("dns server returned rcode {0}")]
    ResponseCode(u16),
}

/// Errors from one directory refresh cycle.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Neither an override address nor a DNS name is configured.
    #[error("no discovery backend configured: set an override address or a dns name")]
    NotConfigured,

    /// SRV lookup of the discovery backend failed.
    #[error("discovery backend lookup failed: {0}")]
    Dns(#[from] DnsError),

    /// SRV lookup succeeded but returned no answers.
    #[error("no SRV records found for {0}")]
    NoSrvRecords(String),

    /// The discovery backend address is not a usable base URL.
    #[error("invalid discovery backend address {address}: {detail}")]
    InvalidAddress { address: String, detail: String },

    /// The Consul HTTP request failed.
    #[error("service query failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The Consul API answered with a non-success status.
    #[error("service query failed (status={status}): {body}")]
    Status { status: u16, body: String },

    /// The query succeeded but no healthy instance was returned.
    #[error("no healthy instances of {0}")]
    NoHealthyInstances(String),
}

impl DiscoveryError {
    /// Stable reason code used in log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DiscoveryError::NotConfigured => "not_configured",
            DiscoveryError::Dns(_) => "dns_failed",
            DiscoveryError::NoSrvRecords(_) => "no_srv_records",
            DiscoveryError::InvalidAddress { .. } => "invalid_address",
            DiscoveryError::Http(_) => "query_failed",
            DiscoveryError::Status { .. } => "query_status",
            DiscoveryError::NoHealthyInstances(_) => "no_healthy_instances",
        }
    }
}

/// Errors from a proxy engine or one of its connections.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The configured bind host/port did not resolve to a socket address.
    #[error("invalid local bind address {address}: {detail}")]
    InvalidBindAddress { address: String, detail: String },

    /// Binding the local listener failed.
    #[error("unable to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed; the listener is considered dead.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The directory had no endpoint for a new connection.
    #[error("no endpoint available for service {0}")]
    NoEndpoint(String),

    /// Connecting to the selected endpoint failed.
    #[error("dial {endpoint} failed: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// A copy task panicked or was aborted.
    #[error("copy task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Other socket error on an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Stable reason code used in log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::InvalidBindAddress { .. } => "invalid_bind_address",
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::Accept(_) => "accept_failed",
            ProxyError::NoEndpoint(_) => "no_endpoint",
            ProxyError::Dial { .. } => "dial_failed",
            ProxyError::Join(_) => "join_failed",
            ProxyError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(DiscoveryError::NotConfigured.reason_code(), "not_configured");
        assert_eq!(
            DiscoveryError::NoSrvRecords("consul.service.".into()).reason_code(),
            "no_srv_records"
        );
        assert_eq!(
            ProxyError::NoEndpoint("web".into()).reason_code(),
            "no_endpoint"
        );
    }

    #[test]
    fn test_dns_error_converts_into_discovery_error() {
        let err: DiscoveryError = DnsError::ResponseCode(3).into();
        assert_eq!(err.reason_code(), "dns_failed");
        assert_eq!(
            err.to_string(),
            "discovery backend lookup failed: dns server returned rcode 3"
        );
    }
}
