//! Continuously refreshed endpoint directory for one service.
//!
//! Lifecycle:
//! 1. `start()` runs a bootstrap refresh, retrying every poll interval
//!    until one succeeds. Callers never observe an empty directory.
//! 2. A detached task then refreshes on every tick of the poll interval.
//!
//! Each successful refresh builds a fresh [`EndpointSnapshot`] and swaps it
//! in with a single pointer store. A failed refresh (backend unresolvable,
//! query error, or zero healthy instances) is logged and the previously
//! published snapshot is kept.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::consul::ServiceQuerier;
use super::endpoint::{Endpoint, EndpointSnapshot};
use super::resolver::BackendResolver;
use crate::config::DEFAULT_POLL_INTERVAL;
use crate::error::DiscoveryError;

/// Dynamically updated endpoints of one discovered service.
pub struct EndpointDirectory {
    service_name: String,
    partition: Option<String>,
    resolver: Arc<dyn BackendResolver>,
    querier: Arc<dyn ServiceQuerier>,
    poll_interval: Duration,
    /// Only the refresh path stores into this.
    snapshot: ArcSwap<EndpointSnapshot>,
}

impl EndpointDirectory {
    /// Create a directory polling at the default interval.
    pub fn new(
        service_name: impl Into<String>,
        partition: Option<String>,
        resolver: Arc<dyn BackendResolver>,
        querier: Arc<dyn ServiceQuerier>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            partition: partition.filter(|p| !p.is_empty()),
            resolver,
            querier,
            poll_interval: DEFAULT_POLL_INTERVAL,
            snapshot: ArcSwap::from_pointee(EndpointSnapshot::default()),
        }
    }

    /// Override the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Current snapshot. Never blocks on a refresh in progress.
    pub fn get_endpoints(&self) -> Arc<EndpointSnapshot> {
        self.snapshot.load_full()
    }

    /// Whether at least one refresh has been published.
    pub fn is_ready(&self) -> bool {
        self.snapshot.load().version() > 0
    }

    /// Resolve the discovery backend and query it, without publishing.
    pub async fn lookup(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let backend = self.resolver.resolve().await?;
        debug!(
            service = %self.service_name,
            backend = %backend,
            datacenter = self.partition().unwrap_or(""),
            "Using consul server"
        );

        let endpoints = self
            .querier
            .healthy_instances(&backend, &self.service_name, self.partition())
            .await?;

        if endpoints.is_empty() {
            return Err(DiscoveryError::NoHealthyInstances(self.service_name.clone()));
        }
        Ok(endpoints)
    }

    /// Run one refresh cycle, publishing a new snapshot on success.
    ///
    /// Returns the version of the published snapshot.
    pub async fn refresh(&self) -> Result<u64, DiscoveryError> {
        let endpoints = self.lookup().await?;
        Ok(self.publish(endpoints))
    }

    fn publish(&self, endpoints: Vec<Endpoint>) -> u64 {
        let version = self.snapshot.load().version() + 1;
        let rendered: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        self.snapshot
            .store(Arc::new(EndpointSnapshot::new(version, endpoints)));

        info!(
            service = %self.service_name,
            version,
            endpoints = ?rendered,
            "Discovered endpoints"
        );
        version
    }

    async fn refresh_logged(&self) -> bool {
        match self.refresh().await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    service = %self.service_name,
                    reason = e.reason_code(),
                    error = %e,
                    "Error discovering service; keeping previous endpoints"
                );
                false
            }
        }
    }

    /// Block until one refresh succeeds, retrying every poll interval.
    pub async fn bootstrap(&self) {
        while !self.refresh_logged().await {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Bootstrap, then refresh in the background on every poll tick.
    ///
    /// Returns once the directory is ready. Call once per directory.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.bootstrap().await;

        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let period = directory.poll_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                directory.refresh_logged().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::DiscoveryBackendConfig;
    use crate::discovery::resolver::{DiscoveryBackendResolver, StaticResolver};

    /// Querier double: fails `fail_first` times, then returns `endpoints`.
    struct StubQuerier {
        endpoints: Mutex<Vec<Endpoint>>,
        failing: Mutex<bool>,
        fail_first: AtomicUsize,
        calls: AtomicUsize,
        last_backend: Mutex<Option<String>>,
    }

    impl StubQuerier {
        fn new(endpoints: Vec<Endpoint>) -> Self {
            Self {
                endpoints: Mutex::new(endpoints),
                failing: Mutex::new(false),
                fail_first: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                last_backend: Mutex::new(None),
            }
        }

        fn set(&self, endpoints: Vec<Endpoint>) {
            *self.endpoints.lock().unwrap() = endpoints;
        }

        fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }
    }

    #[async_trait]
    impl ServiceQuerier for StubQuerier {
        async fn healthy_instances(
            &self,
            backend_address: &str,
            _service_name: &str,
            _partition: Option<&str>,
        ) -> Result<Vec<Endpoint>, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_backend.lock().unwrap() = Some(backend_address.to_string());

            let pending = self.fail_first.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_first.store(pending - 1, Ordering::SeqCst);
                return Err(DiscoveryError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            if *self.failing.lock().unwrap() {
                return Err(DiscoveryError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(self.endpoints.lock().unwrap().clone())
        }
    }

    fn directory(querier: Arc<StubQuerier>, poll: Duration) -> Arc<EndpointDirectory> {
        Arc::new(
            EndpointDirectory::new(
                "test-service-name",
                None,
                Arc::new(StaticResolver::new("this.is.an.override.address")),
                querier,
            )
            .with_poll_interval(poll),
        )
    }

    #[tokio::test]
    async fn test_lookup_maps_instances() {
        let querier = Arc::new(StubQuerier::new(vec![Endpoint::new("an-address", 1234)]));
        let dir = directory(Arc::clone(&querier), Duration::from_secs(30));

        let endpoints = dir.lookup().await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("an-address", 1234)]);
        // lookup alone does not publish
        assert!(!dir.is_ready());
    }

    #[tokio::test]
    async fn test_start_with_override_address_publishes_instances() {
        let config = DiscoveryBackendConfig {
            address: Some("override:1".into()),
            ..Default::default()
        };
        let querier = Arc::new(StubQuerier::new(vec![Endpoint::new("10.0.0.5", 8080)]));
        let dir = Arc::new(EndpointDirectory::new(
            "web",
            None,
            Arc::new(DiscoveryBackendResolver::new(Arc::new(config))),
            Arc::clone(&querier) as Arc<dyn ServiceQuerier>,
        ));

        let handle = dir.start().await;

        let snapshot = dir.get_endpoints();
        assert_eq!(snapshot.endpoints(), &[Endpoint::new("10.0.0.5", 8080)]);
        assert_eq!(snapshot.version(), 1);
        assert_eq!(
            querier.last_backend.lock().unwrap().as_deref(),
            Some("override:1")
        );
        handle.abort();
    }

    #[tokio::test]
    async fn test_start_blocks_until_first_success() {
        let querier = Arc::new(StubQuerier::new(vec![Endpoint::new("an-address-1", 1234)]));
        querier.fail_first.store(2, Ordering::SeqCst);
        let dir = directory(Arc::clone(&querier), Duration::from_millis(20));

        let handle = dir.start().await;

        assert!(dir.is_ready());
        assert_eq!(querier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dir.get_endpoints().first().unwrap().host(), "an-address-1");
        handle.abort();
    }

    #[tokio::test]
    async fn test_background_refresh_replaces_endpoints() {
        let querier = Arc::new(StubQuerier::new(vec![Endpoint::new("an-address-1", 1234)]));
        let dir = directory(Arc::clone(&querier), Duration::from_millis(50));

        let handle = dir.start().await;
        assert_eq!(dir.get_endpoints().first().unwrap().host(), "an-address-1");

        querier.set(vec![Endpoint::new("an-address-2", 4567)]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = dir.get_endpoints();
        assert_eq!(snapshot.first(), Some(&Endpoint::new("an-address-2", 4567)));
        assert!(snapshot.version() > 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let querier = Arc::new(StubQuerier::new(vec![Endpoint::new("10.0.0.1", 80)]));
        let dir = directory(Arc::clone(&querier), Duration::from_secs(30));

        assert_eq!(dir.refresh().await.unwrap(), 1);
        let before = dir.get_endpoints();

        querier.set_failing(true);
        assert!(dir.refresh().await.is_err());

        let after = dir.get_endpoints();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.version(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_keeps_previous_snapshot() {
        let querier = Arc::new(StubQuerier::new(vec![Endpoint::new("10.0.0.1", 80)]));
        let dir = directory(Arc::clone(&querier), Duration::from_secs(30));
        dir.refresh().await.unwrap();

        querier.set(Vec::new());
        let err = dir.refresh().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NoHealthyInstances(_)));
        assert_eq!(dir.get_endpoints().endpoints(), &[Endpoint::new("10.0.0.1", 80)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_observe_mixed_sets() {
        let querier = Arc::new(StubQuerier::new(Vec::new()));
        let dir = directory(Arc::clone(&querier), Duration::from_secs(30));

        let generation = |n: u16| -> Vec<Endpoint> {
            (0..8).map(|i| Endpoint::new(format!("gen-{n}"), i)).collect()
        };
        querier.set(generation(0));
        dir.refresh().await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let dir = Arc::clone(&dir);
            readers.push(tokio::spawn(async move {
                for _ in 0..2000 {
                    let snapshot = dir.get_endpoints();
                    assert_eq!(snapshot.len(), 8);
                    let host = snapshot.endpoints()[0].host().to_string();
                    assert!(snapshot.endpoints().iter().all(|e| e.host() == host));
                    tokio::task::yield_now().await;
                }
            }));
        }

        for n in 1..200 {
            querier.set(generation(n));
            dir.refresh().await.unwrap();
        }

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(dir.get_endpoints().version(), 200);
    }
}
