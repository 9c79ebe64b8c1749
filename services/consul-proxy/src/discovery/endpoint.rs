//! Endpoint values and the published endpoint snapshot.

use std::fmt;

/// A backend address a proxy may forward to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Formats as `host:port`, bracketing IPv6 literals.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Immutable endpoint set published by a directory.
///
/// A snapshot is never mutated after construction; a refresh builds a new
/// one and swaps it in, so readers always observe a complete set.
#[derive(Debug, Default)]
pub struct EndpointSnapshot {
    /// Publication counter; 0 means nothing has been published yet.
    version: u64,
    endpoints: Vec<Endpoint>,
}

impl EndpointSnapshot {
    pub(crate) fn new(version: u64, endpoints: Vec<Endpoint>) -> Self {
        Self { version, endpoints }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// The endpoint new connections are sent to.
    pub fn first(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
