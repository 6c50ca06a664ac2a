//! Plugin bootstrap and shutdown
//!
//! `PluginProvider` checks configuration and collaborators, wires
//! registry → statistics manager → lifecycle coordinator, and starts every
//! connection provider. Configuration problems and missing collaborators are
//! the only fatal errors in the plugin.

use crate::lifecycle::LifecycleCoordinator;
use async_trait::async_trait;
use parking_lot::Mutex;
use plugin_config::PluginConfig;
use statistics::{DeviceRpc, StatisticsManager};
use std::sync::Arc;
use tracing::{error, info, warn};
use txchain::{ChainManagerRegistry, DataBroker};
use types::{PluginError, Result};

/// Source of switch connect/disconnect events
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Begin accepting connections, reporting them to `coordinator`
    async fn start(&self, coordinator: Arc<LifecycleCoordinator>) -> Result<()>;

    /// Stop accepting connections and disconnect the ones still open
    async fn stop(&self);
}

#[derive(Default)]
pub struct PluginProviderBuilder {
    config: PluginConfig,
    broker: Option<Arc<dyn DataBroker>>,
    rpc: Option<Arc<dyn DeviceRpc>>,
    providers: Vec<Arc<dyn ConnectionProvider>>,
}

impl PluginProviderBuilder {
    pub fn config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    pub fn data_broker(mut self, broker: Arc<dyn DataBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn device_rpc(mut self, rpc: Arc<dyn DeviceRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> PluginProvider {
        PluginProvider {
            config: self.config,
            broker: self.broker,
            rpc: self.rpc,
            providers: self.providers,
            running: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }
}

struct Running {
    coordinator: Arc<LifecycleCoordinator>,
}

pub struct PluginProvider {
    config: PluginConfig,
    broker: Option<Arc<dyn DataBroker>>,
    rpc: Option<Arc<dyn DeviceRpc>>,
    providers: Vec<Arc<dyn ConnectionProvider>>,
    running: Mutex<Option<Running>>,
    /// Held for the whole of `initialize` and `close`
    transition: tokio::sync::Mutex<()>,
}

impl PluginProvider {
    pub fn builder() -> PluginProviderBuilder {
        PluginProviderBuilder::default()
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Validate, wire the core components and start connection providers.
    ///
    /// Returns the coordinator; calling it again while initialized returns the
    /// same coordinator.
    pub async fn initialize(&self) -> Result<Arc<LifecycleCoordinator>> {
        let _transition = self.transition.lock().await;

        if let Some(running) = self.running.lock().as_ref() {
            return Ok(Arc::clone(&running.coordinator));
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid plugin configuration");
            return Err(PluginError::configuration(e.to_string(), Some(e.field())));
        }

        let broker = self.broker.clone().ok_or_else(|| {
            error!("Missing data broker");
            PluginError::missing_collaborator("data broker")
        })?;
        let rpc = self.rpc.clone().ok_or_else(|| {
            error!("Missing device RPC");
            PluginError::missing_collaborator("device rpc")
        })?;

        let registry = ChainManagerRegistry::new(broker);
        let statistics = Arc::new(StatisticsManager::new(&self.config, rpc)?);
        statistics.start();
        let coordinator = LifecycleCoordinator::new(self.config.clone(), registry, Arc::clone(&statistics));

        *self.running.lock() = Some(Running {
            coordinator: Arc::clone(&coordinator),
        });

        let mut started = 0;
        for provider in &self.providers {
            match provider.start(Arc::clone(&coordinator)).await {
                Ok(()) => started += 1,
                Err(e) => warn!(provider = provider.name(), error = %e, "Connection provider failed to start"),
            }
        }

        info!(
            started,
            total = self.providers.len(),
            rpc_quota = self.config.rpc_requests_quota,
            "Plugin initialized, {} of {} connection providers up",
            started,
            self.providers.len()
        );

        Ok(coordinator)
    }

    pub fn is_initialized(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop providers, disconnect every device and stop background tasks
    pub async fn close(&self) {
        let _transition = self.transition.lock().await;

        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.coordinator.begin_shutdown();
        futures::future::join_all(self.providers.iter().map(|provider| provider.stop())).await;

        let closed = running.coordinator.close_all().await;
        running.coordinator.statistics().shutdown();
        running.coordinator.registry().close_all().await;

        info!(devices = closed, "Plugin closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statistics::StatsRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use txchain::MemoryDataBroker;

    struct SilentRpc;

    #[async_trait]
    impl DeviceRpc for SilentRpc {
        async fn send_request(&self, _request: StatsRequest) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn start(&self, _coordinator: Arc<LifecycleCoordinator>) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(PluginError::missing_collaborator("switch listener"));
            }
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_missing_collaborators_are_fatal() {
        let provider = PluginProvider::builder().device_rpc(Arc::new(SilentRpc)).build();
        let err = provider.initialize().await.unwrap_err();
        assert!(matches!(err, PluginError::MissingCollaborator { .. }));
        assert!(err.is_fatal());

        let provider = PluginProvider::builder()
            .data_broker(Arc::new(MemoryDataBroker::new()))
            .build();
        assert!(provider.initialize().await.unwrap_err().is_fatal());
        assert!(!provider.is_initialized());
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut config = PluginConfig::default();
        config.rpc_requests_quota = 0;

        let provider = PluginProvider::builder()
            .config(config)
            .data_broker(Arc::new(MemoryDataBroker::new()))
            .device_rpc(Arc::new(SilentRpc))
            .build();

        match provider.initialize().await.unwrap_err() {
            PluginError::Configuration { field, .. } => assert_eq!(field.as_deref(), Some("rpc_requests_quota")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initialize_starts_providers_and_close_stops_them() {
        let healthy = Arc::new(CountingProvider::default());
        let broken = Arc::new(CountingProvider {
            fail: true,
            ..Default::default()
        });

        let provider = PluginProvider::builder()
            .data_broker(Arc::new(MemoryDataBroker::new()))
            .device_rpc(Arc::new(SilentRpc))
            .connection_provider(healthy.clone())
            .connection_provider(broken.clone())
            .build();

        let coordinator = provider.initialize().await.unwrap();
        let again = provider.initialize().await.unwrap();
        assert!(Arc::ptr_eq(&coordinator, &again));
        assert_eq!(healthy.starts.load(Ordering::SeqCst), 1);
        assert_eq!(broken.starts.load(Ordering::SeqCst), 1);

        provider.close().await;
        provider.close().await;
        assert_eq!(healthy.stops.load(Ordering::SeqCst), 1);
        assert!(!provider.is_initialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_initialize_wires_once() {
        let counting = Arc::new(CountingProvider::default());
        let provider = Arc::new(
            PluginProvider::builder()
                .data_broker(Arc::new(MemoryDataBroker::new()))
                .device_rpc(Arc::new(SilentRpc))
                .connection_provider(counting.clone())
                .build(),
        );

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let provider = Arc::clone(&provider);
                tokio::spawn(async move { provider.initialize().await.unwrap() })
            })
            .collect();

        let mut coordinators = Vec::new();
        for call in calls {
            coordinators.push(call.await.unwrap());
        }

        assert!(coordinators.iter().all(|c| Arc::ptr_eq(c, &coordinators[0])));
        assert_eq!(counting.starts.load(Ordering::SeqCst), 1);

        provider.close().await;
        assert_eq!(counting.stops.load(Ordering::SeqCst), 1);
    }
}
