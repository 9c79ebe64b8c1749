//! Local listener and per-connection forwarding.
//!
//! Per connection:
//! - read the directory's current snapshot and take its first endpoint
//! - dial it (no retry, no fallback to other endpoints)
//! - pipe bytes both ways with half-close propagation
//!
//! An accept error ends the engine; connection errors only affect the one
//! client. No idle timeout or connection limit is applied.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::pipe::pipe;
use crate::config::ProxiedServiceSpec;
use crate::discovery::EndpointDirectory;
use crate::error::ProxyError;
use crate::net::prefer_ipv4;

/// Statistics for a proxy engine.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections dropped because the directory had no endpoint.
    pub no_endpoint: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// TCP proxy for one discovered service.
pub struct ProxyEngine {
    spec: ProxiedServiceSpec,
    listener: TcpListener,
    directory: Arc<EndpointDirectory>,
    stats: Arc<ProxyStats>,
}

impl ProxyEngine {
    /// Resolve the configured bind host and port into a listen address.
    ///
    /// IPv4 results win over IPv6 ones.
    pub async fn local(spec: &ProxiedServiceSpec) -> Result<SocketAddr, ProxyError> {
        let host = spec
            .local_bind_host
            .trim_start_matches('[')
            .trim_end_matches(']');
        let invalid = |detail: String| ProxyError::InvalidBindAddress {
            address: format!("{}:{}", spec.local_bind_host, spec.local_port),
            detail,
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid("unparsable host".to_string()));
        }

        let addrs = tokio::net::lookup_host((host, spec.local_port))
            .await
            .map_err(|e| invalid(e.to_string()))?;
        prefer_ipv4(addrs).ok_or_else(|| invalid("no addresses".to_string()))
    }

    /// Bind the local listener for `spec`.
    pub async fn bind(
        spec: ProxiedServiceSpec,
        directory: Arc<EndpointDirectory>,
    ) -> Result<Self, ProxyError> {
        let local_addr = Self::local(&spec).await?;
        let listener = TcpListener::bind(local_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                address: local_addr.to_string(),
                source,
            })?;

        info!(
            bind_addr = %listener.local_addr().unwrap_or(local_addr),
            service = %spec.service_name,
            "Proxy bound"
        );

        Ok(Self {
            spec,
            listener,
            directory,
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Bind and serve forever.
    pub async fn start(
        spec: ProxiedServiceSpec,
        directory: Arc<EndpointDirectory>,
    ) -> Result<(), ProxyError> {
        let engine = Arc::new(Self::bind(spec, directory).await?);
        engine.run().await
    }

    /// Get the local address this engine is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get engine statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            service = %self.spec.service_name,
            "Now listening"
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(
                        bind_addr = %local_addr,
                        service = %self.spec.service_name,
                        error = %e,
                        "Accept error"
                    );
                    return Err(ProxyError::Accept(e));
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let engine = Arc::clone(&self);

            tokio::spawn(
                async move {
                    if let Err(e) = engine.handle_connection(stream).await {
                        debug!(
                            reason = e.reason_code(),
                            error = %e,
                            "Connection error"
                        );
                    }

                    engine
                        .stats
                        .connections_active
                        .fetch_sub(1, Ordering::Relaxed);
                    engine
                        .stats
                        .connections_closed
                        .fetch_add(1, Ordering::Relaxed);
                }
                .instrument(tracing::info_span!(
                    "connection",
                    peer = %peer_addr,
                    service = %self.spec.service_name
                )),
            );
        }
    }

    /// Forward one client connection to the directory's current endpoint.
    async fn handle_connection(&self, client: TcpStream) -> Result<(), ProxyError> {
        let snapshot = self.directory.get_endpoints();
        let Some(endpoint) = snapshot.first().cloned() else {
            self.stats.no_endpoint.fetch_add(1, Ordering::Relaxed);
            warn!("No endpoint available, closing client connection");
            return Err(ProxyError::NoEndpoint(self.spec.service_name.clone()));
        };

        let backend = match TcpStream::connect((endpoint.host(), endpoint.port())).await {
            Ok(stream) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(source) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %endpoint, error = %source, "Backend connection failed");
                return Err(ProxyError::Dial {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
        };

        debug!(
            endpoint = %endpoint,
            snapshot_version = snapshot.version(),
            "Proxying"
        );

        let (bytes_to_backend, bytes_from_backend) = pipe(client, backend).await?;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);

        debug!(
            endpoint = %endpoint,
            bytes_to_backend,
            bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Endpoint, ServiceQuerier, StaticResolver};
    use crate::error::DiscoveryError;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FixedQuerier(Vec<Endpoint>);

    #[async_trait]
    impl ServiceQuerier for FixedQuerier {
        async fn healthy_instances(
            &self,
            _backend_address: &str,
            _service_name: &str,
            _partition: Option<&str>,
        ) -> Result<Vec<Endpoint>, DiscoveryError> {
            Ok(self.0.clone())
        }
    }

    fn directory(endpoints: Vec<Endpoint>) -> Arc<EndpointDirectory> {
        Arc::new(EndpointDirectory::new(
            "web",
            None,
            Arc::new(StaticResolver::new("override:1")),
            Arc::new(FixedQuerier(endpoints)),
        ))
    }

    #[tokio::test]
    async fn test_local_resolves_bind_address() {
        let spec = ProxiedServiceSpec::new("web", "127.0.0.1", 9090);
        let addr = ProxyEngine::local(&spec).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());

        let spec = ProxiedServiceSpec::new("web", "[::1]", 9091);
        let addr = ProxyEngine::local(&spec).await.unwrap();
        assert_eq!(addr, "[::1]:9091".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_local_localhost_binds_ipv4_loopback() {
        let spec = ProxiedServiceSpec::new("web", "localhost", 9092);
        let addr = ProxyEngine::local(&spec).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9092".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_local_rejects_unparsable_bind_address() {
        let spec = ProxiedServiceSpec::new("web", "not a host name", 9090);
        let err = ProxyEngine::local(&spec).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidBindAddress { .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let spec = ProxiedServiceSpec::new("web", "127.0.0.1", port);
        let err = ProxyEngine::bind(spec, directory(Vec::new()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.reason_code(), "bind_failed");
    }

    #[tokio::test]
    async fn test_empty_directory_closes_client() {
        let spec = ProxiedServiceSpec::new("web", "127.0.0.1", 0);
        let engine = Arc::new(ProxyEngine::bind(spec, directory(Vec::new())).await.unwrap());
        let addr = engine.local_addr().unwrap();
        tokio::spawn(Arc::clone(&engine).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        // Closed without any data
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.stats().no_endpoint.load(Ordering::Relaxed), 1);
        assert_eq!(engine.stats().connections_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let dir = directory(vec![Endpoint::new("127.0.0.1", dead_port)]);
        dir.refresh().await.unwrap();

        let spec = ProxiedServiceSpec::new("web", "127.0.0.1", 0);
        let engine = Arc::new(ProxyEngine::bind(spec, dir).await.unwrap());
        let addr = engine.local_addr().unwrap();
        tokio::spawn(Arc::clone(&engine).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(b"ping").await;
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.stats().backend_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_proxy_stats() {
        let stats = ProxyStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }
}
